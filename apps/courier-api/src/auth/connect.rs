//! Bearer credential extraction for inbound gateway connections.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

/// Credential material gathered from the three transport locations a client
/// may present a token in, checked in precedence order.
#[derive(Debug, Default)]
pub struct ConnectRequest {
    /// Explicit auth field on the IDENTIFY handshake message.
    pub handshake_token: Option<String>,
    /// `token` query-string parameter on the upgrade request.
    pub query_token: Option<String>,
    /// `Authorization: Bearer <token>` header on the upgrade request.
    pub bearer_token: Option<String>,
}

impl ConnectRequest {
    /// Capture the upgrade-time locations (query param, header). The
    /// handshake field is filled in later, once the IDENTIFY message arrives.
    pub fn from_upgrade(query_token: Option<String>, headers: &HeaderMap) -> Self {
        let bearer_token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.to_string());
        Self {
            handshake_token: None,
            query_token: query_token.filter(|t| !t.is_empty()),
            bearer_token,
        }
    }

    /// Resolve the credential: handshake field first, then query parameter,
    /// then bearer header. `None` means the connection presented nothing
    /// and must be rejected before admission.
    pub fn credential(&self) -> Option<&str> {
        self.handshake_token
            .as_deref()
            .or(self.query_token.as_deref())
            .or(self.bearer_token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn handshake_field_wins_over_query_and_header() {
        let mut req =
            ConnectRequest::from_upgrade(Some("from-query".into()), &headers_with_bearer("from-header"));
        req.handshake_token = Some("from-handshake".into());
        assert_eq!(req.credential(), Some("from-handshake"));
    }

    #[test]
    fn query_wins_over_header() {
        let req =
            ConnectRequest::from_upgrade(Some("from-query".into()), &headers_with_bearer("from-header"));
        assert_eq!(req.credential(), Some("from-query"));
    }

    #[test]
    fn bearer_header_used_last() {
        let req = ConnectRequest::from_upgrade(None, &headers_with_bearer("from-header"));
        assert_eq!(req.credential(), Some("from-header"));
    }

    #[test]
    fn malformed_authorization_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
        let req = ConnectRequest::from_upgrade(None, &headers);
        assert_eq!(req.credential(), None);
    }

    #[test]
    fn missing_everywhere_is_none() {
        let req = ConnectRequest::from_upgrade(None, &HeaderMap::new());
        assert_eq!(req.credential(), None);
    }

    #[test]
    fn empty_query_token_does_not_count() {
        let req = ConnectRequest::from_upgrade(Some(String::new()), &HeaderMap::new());
        assert_eq!(req.credential(), None);
    }
}
