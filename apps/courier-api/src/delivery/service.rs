//! Delivery decision logic: live push when reachable, durable fallback when
//! not, and the paced replay of missed notifications on reconnect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::error::ApiError;
use crate::gateway::envelope::{Envelope, MessageKind};
use crate::gateway::registry::ConnectionRegistry;
use crate::sanitize::{sanitize_announcement, AnnouncementContent};

use super::store::{NewNotification, Notification, NotificationStore};

/// How many unread records are replayed over the live channel on reconnect.
pub const DEFAULT_REPLAY_LIMIT: usize = 3;

/// Pause between replayed records, so a reconnecting client is not hit with
/// a burst.
pub const DEFAULT_REPLAY_SPACING: Duration = Duration::from_millis(1000);

/// Whether a durable record is written even when the target was reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Persist only when the live push cannot happen.
    WhenOffline,
    /// Always persist, keeping history for reachable users too.
    Always,
}

/// What a single-target delivery ended up doing.
#[derive(Debug)]
pub struct DeliveryOutcome {
    /// Connections the live push reached (0 when the user was offline).
    pub delivered_live: usize,
    /// The durable record, when one was written.
    pub persisted: Option<Notification>,
}

pub struct DeliveryService {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn NotificationStore>,
    replay_limit: usize,
    replay_spacing: Duration,
}

impl DeliveryService {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn NotificationStore>) -> Self {
        Self {
            registry,
            store,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            replay_spacing: DEFAULT_REPLAY_SPACING,
        }
    }

    pub fn with_replay(mut self, limit: usize, spacing: Duration) -> Self {
        self.replay_limit = limit;
        self.replay_spacing = spacing;
        self
    }

    /// Notify a single identity.
    ///
    /// Reachable target: push live over every one of its connections, and
    /// persist too when the caller wants history. Unreachable target: persist
    /// only — that is the expected fallback branch, not an error.
    pub async fn notify_user(
        &self,
        new: NewNotification,
        policy: PersistPolicy,
    ) -> Result<DeliveryOutcome, ApiError> {
        let recipient_id = new.recipient_id.clone();

        if !self.registry.is_user_online(&recipient_id) {
            let record = self.store.persist(new).await?;
            tracing::debug!(
                recipient_id = %recipient_id,
                notification_id = %record.id,
                "target offline, stored durable notification"
            );
            return Ok(DeliveryOutcome {
                delivered_live: 0,
                persisted: Some(record),
            });
        }

        let persisted = match policy {
            PersistPolicy::Always => Some(self.store.persist(new.clone()).await?),
            PersistPolicy::WhenOffline => None,
        };

        let data = match &persisted {
            Some(record) => serde_json::to_value(record)
                .map_err(|e| ApiError::internal(format!("serialize notification: {e}")))?,
            None => json!({
                "title": new.title,
                "content": new.content,
                "category": new.category,
                "level": new.level,
                "action": new.action,
                "extra": new.extra,
            }),
        };

        let envelope = Envelope::new(MessageKind::NotificationNew, data);
        let delivered_live = self.registry.send_to_user(&recipient_id, &envelope);
        Ok(DeliveryOutcome {
            delivered_live,
            persisted,
        })
    }

    /// Sanitize an announcement and push it to every live connection.
    /// Returns how many connections accepted it. Persisting announcement
    /// history for offline users is the announcement service's job.
    pub fn broadcast_announcement(
        &self,
        kind: MessageKind,
        announcement: AnnouncementContent,
    ) -> usize {
        let clean = sanitize_announcement(announcement);
        let envelope = Envelope::new(kind, json!(clean));
        self.registry.broadcast_to_all(&envelope)
    }

    /// The subset of the given identities with no live connection — the ones
    /// a group-notifying caller must write durable records for.
    pub fn unreachable_subset(&self, user_ids: &[String]) -> Vec<String> {
        user_ids
            .iter()
            .filter(|id| !self.registry.is_user_online(id))
            .cloned()
            .collect()
    }

    /// Replay the most recent unread notifications to a freshly connected
    /// user, newest first, paced so the session bootstrap is not a burst.
    ///
    /// `already_pushed` is owned by the caller's session bootstrap; records
    /// whose id is already in it are skipped, and every pushed id is added,
    /// so one bootstrap never delivers the same record twice.
    pub async fn replay_recent_unread(
        &self,
        user_id: &str,
        already_pushed: &mut HashSet<String>,
    ) -> Result<usize, ApiError> {
        let records = self.store.recent_unread(user_id, self.replay_limit).await?;

        let mut pushed = 0;
        for record in records {
            if !already_pushed.insert(record.id.clone()) {
                continue;
            }
            if pushed > 0 {
                tokio::time::sleep(self.replay_spacing).await;
            }
            let data = serde_json::to_value(&record)
                .map_err(|e| ApiError::internal(format!("serialize notification: {e}")))?;
            let envelope = Envelope::new(MessageKind::NotificationNew, data);
            self.registry.send_to_user(user_id, &envelope);
            pushed += 1;
        }

        if pushed > 0 {
            tracing::info!(user_id = %user_id, count = pushed, "replayed unread notifications");
        }
        Ok(pushed)
    }
}
