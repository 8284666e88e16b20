//! Durable notification storage, consumed through a narrow contract.
//!
//! The storage engine and schema belong to the back office's persistence
//! layer; this core only needs "persist one record" and "read back the
//! most recent unread ones". Backed by SQL in production and an in-memory
//! list here and in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

/// Severity of a durable notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A notification awaiting persistence.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub level: NotifyLevel,
    pub action: Option<Value>,
    pub extra: Option<Value>,
}

/// A persisted notification record, standing in for a live push that could
/// not be delivered immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub level: NotifyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Abstraction over the durable notification store.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist one outbound notification, unread.
    async fn persist(&self, new: NewNotification) -> Result<Notification, ApiError>;

    /// The recipient's most recent unread records, newest first.
    async fn recent_unread(
        &self,
        recipient_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single node / tests)
// ---------------------------------------------------------------------------

pub struct MemoryNotificationStore {
    records: Mutex<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Test hook: every record for a recipient, in insertion order.
    pub fn all_for(&self, recipient_id: &str) -> Vec<Notification> {
        self.records
            .lock()
            .iter()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect()
    }
}

impl Default for MemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn persist(&self, new: NewNotification) -> Result<Notification, ApiError> {
        let record = Notification {
            id: courier_common::id::prefixed_ulid("ntf"),
            recipient_id: new.recipient_id,
            title: new.title,
            content: new.content,
            category: new.category,
            level: new.level,
            action: new.action,
            extra: new.extra,
            read: false,
            read_at: None,
            created_at: Utc::now(),
        };
        self.records.lock().push(record.clone());
        Ok(record)
    }

    async fn recent_unread(
        &self,
        recipient_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, ApiError> {
        let records = self.records.lock();
        let mut unread: Vec<Notification> = records
            .iter()
            .filter(|n| n.recipient_id == recipient_id && !n.read)
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        unread.truncate(limit);
        Ok(unread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_notification(recipient: &str, title: &str) -> NewNotification {
        NewNotification {
            recipient_id: recipient.to_string(),
            title: title.to_string(),
            content: "body".to_string(),
            category: "system".to_string(),
            level: NotifyLevel::Info,
            action: None,
            extra: None,
        }
    }

    #[tokio::test]
    async fn persist_creates_unread_record_with_id() {
        let store = MemoryNotificationStore::new();
        let record = store.persist(new_notification("u1", "hello")).await.unwrap();
        assert!(record.id.starts_with("ntf_"));
        assert!(!record.read);
        assert!(record.read_at.is_none());
    }

    #[tokio::test]
    async fn recent_unread_is_newest_first_and_bounded() {
        let store = MemoryNotificationStore::new();
        for i in 0..5 {
            store
                .persist(new_notification("u1", &format!("n{i}")))
                .await
                .unwrap();
            // ULID creation is fast enough that created_at can tie; nudge.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.persist(new_notification("u2", "other")).await.unwrap();

        let unread = store.recent_unread("u1", 3).await.unwrap();
        assert_eq!(unread.len(), 3);
        assert_eq!(unread[0].title, "n4");
        assert_eq!(unread[1].title, "n3");
        assert_eq!(unread[2].title, "n2");
    }

    #[tokio::test]
    async fn recent_unread_for_unknown_recipient_is_empty() {
        let store = MemoryNotificationStore::new();
        assert!(store.recent_unread("ghost", 3).await.unwrap().is_empty());
    }
}
