//! Wire-format message envelope shared by every delivery component.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type tags. The set is closed but extensible: add a variant here
/// and every component that routes on type picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    // System / session control.
    Identify,
    Ready,
    Ping,
    Pong,
    Error,
    // Broadcast-class business events.
    AnnouncementNew,
    AnnouncementUpdate,
    AnnouncementDelete,
    NotificationNew,
    ChatMessage,
    PresenceCount,
    MembershipExpiry,
}

/// A tagged payload sent over the live channel, in either direction.
///
/// Immutable once constructed — batching copies envelopes, never mutates
/// them. A missing `timestamp` means send-time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    /// Build an envelope with an explicit timestamp.
    pub fn with_timestamp(kind: MessageKind, data: Value, timestamp: i64) -> Self {
        Self {
            kind,
            data,
            timestamp: Some(timestamp),
        }
    }

    /// Build a PONG reply.
    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, Value::Null)
    }

    /// Build an ERROR envelope carrying a human-readable message.
    pub fn error(message: &str) -> Self {
        Self::new(MessageKind::Error, serde_json::json!({ "message": message }))
    }
}

/// Combine several same-type envelopes into one.
///
/// Array payloads are concatenated in order; scalar and object payloads are
/// replaced by the most recent one. The merged timestamp is the most recent
/// among the inputs. Returns `None` for an empty slice or mixed types —
/// merging is opt-in per call site, so a caller handing in mixed kinds is a
/// bug worth surfacing rather than papering over.
pub fn merge(envelopes: &[Envelope]) -> Option<Envelope> {
    let first = envelopes.first()?;
    if envelopes.iter().any(|e| e.kind != first.kind) {
        return None;
    }

    let mut data = first.data.clone();
    let mut timestamp = first.timestamp;

    for env in &envelopes[1..] {
        match (&mut data, &env.data) {
            (Value::Array(acc), Value::Array(next)) => acc.extend(next.iter().cloned()),
            _ => data = env.data.clone(),
        }
        timestamp = match (timestamp, env.timestamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => b.or(a),
        };
    }

    Some(Envelope {
        kind: first.kind,
        data,
        timestamp,
    })
}
