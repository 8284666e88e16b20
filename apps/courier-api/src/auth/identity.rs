//! Identity verification against the external identity service.

use async_trait::async_trait;
use serde::Deserialize;

/// The authenticated subject a connection is bound to.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Why a credential failed verification.
#[derive(Debug)]
pub enum VerifyError {
    /// The identity service examined the credential and rejected it
    /// (malformed, expired, or unknown subject).
    Rejected(String),
    /// The identity service could not be reached.
    Unavailable(String),
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "credential rejected: {reason}"),
            Self::Unavailable(reason) => write!(f, "identity service unavailable: {reason}"),
        }
    }
}

/// Abstraction over the external identity service.
///
/// Backed by an HTTP call in production and a static map in tests.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Verifies bearer credentials by calling the identity service.
#[derive(Clone)]
pub struct IdentityClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VerifyRejection {
    message: Option<String>,
}

impl IdentityClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for IdentityClient {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError> {
        let url = format!("{}/api/v1/identity/verify", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "token": credential }))
            .send()
            .await
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        if resp.status().is_success() {
            return resp
                .json::<Identity>()
                .await
                .map_err(|e| VerifyError::Unavailable(format!("malformed response: {e}")));
        }

        let status = resp.status();
        let reason = resp
            .json::<VerifyRejection>()
            .await
            .ok()
            .and_then(|r| r.message)
            .unwrap_or_else(|| status.to_string());
        Err(VerifyError::Rejected(reason))
    }
}

// ---------------------------------------------------------------------------
// Static implementation (for tests)
// ---------------------------------------------------------------------------

/// For tests: a verifier pre-loaded with known credential → identity pairs.
pub struct StaticVerifier {
    identities: std::collections::HashMap<String, Identity>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self {
            identities: std::collections::HashMap::new(),
        }
    }

    pub fn with_identity(mut self, credential: &str, identity: Identity) -> Self {
        self.identities.insert(credential.to_string(), identity);
        self
    }
}

impl Default for StaticVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError> {
        self.identities
            .get(credential)
            .cloned()
            .ok_or_else(|| VerifyError::Rejected("unknown credential".to_string()))
    }
}
