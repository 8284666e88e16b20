//! Live connection registry: who is reachable right now, and over which
//! connections.
//!
//! Two index maps — connection→entry and identity→connection-id set — live
//! behind a single `parking_lot::RwLock` so every method sees them change
//! together. Emission is fire-and-forget through each connection's bounded
//! mpsc sender; a full queue or dead peer never stalls delivery to the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::auth::identity::Identity;

use super::envelope::Envelope;

/// Connections whose last heartbeat is older than this are forcibly
/// reclaimed by `cleanup_inactive`.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Outbound queue depth per connection. When full, frames for that
/// connection are dropped (and logged), not awaited.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// A serialized envelope ready to write to a socket. Shared across every
/// recipient of a group send, serialized once.
pub type OutboundFrame = Arc<str>;

/// A transport-level link handed to the registry after authentication.
pub struct Connection {
    pub connection_id: String,
    /// `None` means the admission gate was bypassed — `add_client` refuses
    /// to register such a connection.
    pub identity: Option<Identity>,
    pub sender: mpsc::Sender<OutboundFrame>,
}

struct ConnectionEntry {
    identity: Identity,
    connected_at: Instant,
    last_heartbeat: Instant,
    sender: mpsc::Sender<OutboundFrame>,
}

/// Snapshot of one live connection, for queries.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub connection_id: String,
    pub user_id: String,
    pub display_name: String,
    pub roles: Vec<String>,
    pub connected_for: Duration,
}

struct Inner {
    /// connection id → entry.
    connections: HashMap<String, ConnectionEntry>,
    /// identity id → ids of its live connections. An identity with no live
    /// connections has no key here at all, so reachability is a plain
    /// `contains_key`.
    by_user: HashMap<String, HashSet<String>>,
}

/// Shared registry of all live gateway connections.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    stale_after: Duration,
}

impl ConnectionRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: HashMap::new(),
                by_user: HashMap::new(),
            }),
            stale_after,
        }
    }

    /// Record an authenticated connection in both indices.
    ///
    /// A connection without a verified identity is refused with a warning —
    /// the admission gate should have rejected it long before this point.
    /// Returns whether the connection was registered.
    pub fn add_client(&self, conn: Connection) -> bool {
        let Some(identity) = conn.identity else {
            tracing::warn!(
                connection_id = %conn.connection_id,
                "refusing to register connection without identity"
            );
            return false;
        };

        let now = Instant::now();
        let mut inner = self.inner.write();
        inner
            .by_user
            .entry(identity.id.clone())
            .or_default()
            .insert(conn.connection_id.clone());
        inner.connections.insert(
            conn.connection_id,
            ConnectionEntry {
                identity,
                connected_at: now,
                last_heartbeat: now,
                sender: conn.sender,
            },
        );
        true
    }

    /// Remove a connection from both indices. When its identity's fan-out
    /// set becomes empty the identity entry itself is dropped, so
    /// reachability queries never report long-gone users.
    pub fn remove_client(&self, connection_id: &str) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.connections.remove(connection_id) else {
            return;
        };
        if let Some(set) = inner.by_user.get_mut(&entry.identity.id) {
            set.remove(connection_id);
            if set.is_empty() {
                inner.by_user.remove(&entry.identity.id);
            }
        }
    }

    /// Refresh a connection's liveness. No-op for unknown connections
    /// (already removed).
    pub fn update_heartbeat(&self, connection_id: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.connections.get_mut(connection_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// True iff the identity has at least one live connection.
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.inner.read().by_user.contains_key(user_id)
    }

    pub fn online_user_count(&self) -> usize {
        self.inner.read().by_user.len()
    }

    pub fn online_connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn clients_for_user(&self, user_id: &str) -> Vec<ClientInfo> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_user.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.connections.get(id).map(|e| snapshot(id, e)))
            .collect()
    }

    pub fn clients_for_role(&self, role: &str) -> Vec<ClientInfo> {
        let inner = self.inner.read();
        inner
            .connections
            .iter()
            .filter(|(_, e)| e.identity.roles.iter().any(|r| r == role))
            .map(|(id, e)| snapshot(id, e))
            .collect()
    }

    pub fn all_clients(&self) -> Vec<ClientInfo> {
        let inner = self.inner.read();
        inner
            .connections
            .iter()
            .map(|(id, e)| snapshot(id, e))
            .collect()
    }

    /// Push to every live connection. Returns how many accepted the frame.
    pub fn broadcast_to_all(&self, envelope: &Envelope) -> usize {
        let targets = {
            let inner = self.inner.read();
            inner
                .connections
                .iter()
                .map(|(id, e)| (id.clone(), e.sender.clone()))
                .collect::<Vec<_>>()
        };
        self.emit(&targets, envelope)
    }

    /// Push to every connection bound to one identity.
    pub fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> usize {
        let targets = {
            let inner = self.inner.read();
            let mut targets = Vec::new();
            if let Some(ids) = inner.by_user.get(user_id) {
                for id in ids {
                    if let Some(entry) = inner.connections.get(id) {
                        targets.push((id.clone(), entry.sender.clone()));
                    }
                }
            }
            targets
        };
        self.emit(&targets, envelope)
    }

    /// Push to every connection bound to any of the given identities.
    pub fn send_to_users(&self, user_ids: &[String], envelope: &Envelope) -> usize {
        let targets = {
            let inner = self.inner.read();
            let mut targets = Vec::new();
            for user_id in user_ids {
                let Some(ids) = inner.by_user.get(user_id) else {
                    continue;
                };
                for id in ids {
                    if let Some(entry) = inner.connections.get(id) {
                        targets.push((id.clone(), entry.sender.clone()));
                    }
                }
            }
            targets
        };
        self.emit(&targets, envelope)
    }

    /// Push to every connection whose identity carries the given role.
    pub fn send_to_role(&self, role: &str, envelope: &Envelope) -> usize {
        let targets = {
            let inner = self.inner.read();
            inner
                .connections
                .iter()
                .filter(|(_, e)| e.identity.roles.iter().any(|r| r == role))
                .map(|(id, e)| (id.clone(), e.sender.clone()))
                .collect::<Vec<_>>()
        };
        self.emit(&targets, envelope)
    }

    /// Forcibly reclaim connections whose heartbeat has gone stale. The
    /// registry drops its sender, which closes the connection's outbound
    /// pump and with it the socket. Returns the number removed.
    ///
    /// This is the only reclaim path for connections whose transport-level
    /// close event was lost.
    pub fn cleanup_inactive(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .connections
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heartbeat) > self.stale_after)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(entry) = inner.connections.remove(id) {
                tracing::warn!(
                    connection_id = %id,
                    user_id = %entry.identity.id,
                    "reclaiming stale connection"
                );
                if let Some(set) = inner.by_user.get_mut(&entry.identity.id) {
                    set.remove(id);
                    if set.is_empty() {
                        inner.by_user.remove(&entry.identity.id);
                    }
                }
            }
        }
        stale.len()
    }

    /// Best-effort multicast: serialize once, attempt each target
    /// independently, skip and log failures. Nothing propagates to the
    /// caller beyond the delivered count.
    fn emit(&self, targets: &[(String, mpsc::Sender<OutboundFrame>)], envelope: &Envelope) -> usize {
        let frame: OutboundFrame = match serde_json::to_string(envelope) {
            Ok(text) => text.into(),
            Err(err) => {
                tracing::error!(?err, kind = ?envelope.kind, "failed to serialize envelope");
                return 0;
            }
        };

        let mut delivered = 0;
        for (connection_id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        ?err,
                        "dropping frame for unresponsive connection"
                    );
                }
            }
        }
        delivered
    }

    /// Check that the two indices agree: every fan-out member has a live
    /// entry mapping back to that identity, and vice versa.
    #[cfg(test)]
    fn assert_indices_consistent(&self) {
        let inner = self.inner.read();
        for (user_id, ids) in &inner.by_user {
            assert!(!ids.is_empty(), "empty fan-out set left behind for {user_id}");
            for id in ids {
                let entry = inner
                    .connections
                    .get(id)
                    .unwrap_or_else(|| panic!("{id} in fan-out set but not in connections"));
                assert_eq!(&entry.identity.id, user_id);
            }
        }
        for (id, entry) in &inner.connections {
            let set = inner
                .by_user
                .get(&entry.identity.id)
                .unwrap_or_else(|| panic!("{id} has no fan-out set"));
            assert!(set.contains(id));
        }
    }

    /// Test hook: backdate a connection's heartbeat.
    #[cfg(test)]
    fn backdate_heartbeat(&self, connection_id: &str, age: Duration) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.connections.get_mut(connection_id) {
            entry.last_heartbeat = Instant::now() - age;
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

fn snapshot(connection_id: &str, entry: &ConnectionEntry) -> ClientInfo {
    ClientInfo {
        connection_id: connection_id.to_string(),
        user_id: entry.identity.id.clone(),
        display_name: entry.identity.display_name.clone(),
        roles: entry.identity.roles.clone(),
        connected_for: entry.connected_at.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::envelope::MessageKind;
    use serde_json::json;

    fn identity(id: &str, roles: &[&str]) -> Identity {
        Identity {
            id: id.to_string(),
            display_name: format!("user {id}"),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn connect(
        registry: &ConnectionRegistry,
        conn_id: &str,
        user_id: &str,
        roles: &[&str],
    ) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        assert!(registry.add_client(Connection {
            connection_id: conn_id.to_string(),
            identity: Some(identity(user_id, roles)),
            sender: tx,
        }));
        rx
    }

    fn envelope() -> Envelope {
        Envelope::new(MessageKind::NotificationNew, json!({"title": "t"}))
    }

    #[test]
    fn add_without_identity_is_refused() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::channel(4);
        let added = registry.add_client(Connection {
            connection_id: "conn_1".to_string(),
            identity: None,
            sender: tx,
        });
        assert!(!added);
        assert_eq!(registry.online_connection_count(), 0);
    }

    #[test]
    fn online_iff_has_live_connection() {
        let registry = ConnectionRegistry::default();
        assert!(!registry.is_user_online("u1"));

        let _rx = connect(&registry, "conn_1", "u1", &[]);
        assert!(registry.is_user_online("u1"));
        assert_eq!(registry.clients_for_user("u1").len(), 1);

        registry.remove_client("conn_1");
        assert!(!registry.is_user_online("u1"));
        assert!(registry.clients_for_user("u1").is_empty());
        registry.assert_indices_consistent();
    }

    #[test]
    fn multiple_connections_per_identity() {
        let registry = ConnectionRegistry::default();
        let _rx1 = connect(&registry, "conn_1", "u1", &[]);
        let _rx2 = connect(&registry, "conn_2", "u1", &[]);

        assert_eq!(registry.clients_for_user("u1").len(), 2);
        assert_eq!(registry.online_user_count(), 1);
        assert_eq!(registry.online_connection_count(), 2);

        // One tab closes; the user is still reachable.
        registry.remove_client("conn_1");
        assert!(registry.is_user_online("u1"));

        registry.remove_client("conn_2");
        assert!(!registry.is_user_online("u1"));
        registry.assert_indices_consistent();
    }

    #[test]
    fn remove_unknown_connection_is_noop() {
        let registry = ConnectionRegistry::default();
        registry.remove_client("conn_missing");
        registry.update_heartbeat("conn_missing");
        registry.assert_indices_consistent();
    }

    #[test]
    fn send_to_user_reaches_every_connection() {
        let registry = ConnectionRegistry::default();
        let mut rx1 = connect(&registry, "conn_1", "u1", &[]);
        let mut rx2 = connect(&registry, "conn_2", "u1", &[]);
        let _rx3 = connect(&registry, "conn_3", "u2", &[]);

        let delivered = registry.send_to_user("u1", &envelope());
        assert_eq!(delivered, 2);

        let frame = rx1.try_recv().unwrap();
        assert!(frame.contains("notification-new"));
        rx2.try_recv().unwrap();
    }

    #[test]
    fn send_to_offline_user_delivers_nothing() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.send_to_user("ghost", &envelope()), 0);
    }

    #[test]
    fn send_to_users_unions_targets() {
        let registry = ConnectionRegistry::default();
        let mut rx1 = connect(&registry, "conn_1", "u1", &[]);
        let mut rx2 = connect(&registry, "conn_2", "u2", &[]);
        let mut rx3 = connect(&registry, "conn_3", "u3", &[]);

        let delivered =
            registry.send_to_users(&["u1".to_string(), "u3".to_string()], &envelope());
        assert_eq!(delivered, 2);
        rx1.try_recv().unwrap();
        assert!(rx2.try_recv().is_err());
        rx3.try_recv().unwrap();
    }

    #[test]
    fn send_to_role_matches_any_role() {
        let registry = ConnectionRegistry::default();
        let mut rx1 = connect(&registry, "conn_1", "u1", &["admin", "staff"]);
        let mut rx2 = connect(&registry, "conn_2", "u2", &["staff"]);
        let mut rx3 = connect(&registry, "conn_3", "u3", &[]);

        assert_eq!(registry.send_to_role("admin", &envelope()), 1);
        rx1.try_recv().unwrap();
        assert!(rx2.try_recv().is_err());
        assert!(rx3.try_recv().is_err());

        assert_eq!(registry.clients_for_role("staff").len(), 2);
    }

    #[test]
    fn broadcast_skips_failed_connections() {
        let registry = ConnectionRegistry::default();
        let rx1 = connect(&registry, "conn_1", "u1", &[]);
        let mut rx2 = connect(&registry, "conn_2", "u2", &[]);

        // Dead peer: its receiver is gone but the transport close was lost.
        drop(rx1);

        let delivered = registry.broadcast_to_all(&envelope());
        assert_eq!(delivered, 1);
        rx2.try_recv().unwrap();
    }

    #[test]
    fn full_outbound_queue_does_not_block_others() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx_full) = mpsc::channel(1);
        registry.add_client(Connection {
            connection_id: "conn_slow".to_string(),
            identity: Some(identity("u1", &[])),
            sender: tx,
        });
        let mut rx2 = connect(&registry, "conn_2", "u2", &[]);

        // First broadcast fills the slow connection's single-slot queue.
        assert_eq!(registry.broadcast_to_all(&envelope()), 2);
        // Second: the slow connection drops its frame, the healthy one gets it.
        assert_eq!(registry.broadcast_to_all(&envelope()), 1);
        rx2.try_recv().unwrap();
        rx2.try_recv().unwrap();
    }

    #[test]
    fn cleanup_reclaims_only_stale_connections() {
        let registry = ConnectionRegistry::new(Duration::from_secs(300));
        let _rx1 = connect(&registry, "conn_1", "u1", &[]);
        let _rx2 = connect(&registry, "conn_2", "u2", &[]);

        registry.backdate_heartbeat("conn_1", Duration::from_secs(600));

        let removed = registry.cleanup_inactive();
        assert_eq!(removed, 1);
        assert!(!registry.is_user_online("u1"));
        assert!(registry.is_user_online("u2"));
        registry.assert_indices_consistent();
    }

    #[test]
    fn heartbeat_refresh_defers_cleanup() {
        let registry = ConnectionRegistry::new(Duration::from_secs(300));
        let _rx = connect(&registry, "conn_1", "u1", &[]);
        registry.backdate_heartbeat("conn_1", Duration::from_secs(600));

        registry.update_heartbeat("conn_1");
        assert_eq!(registry.cleanup_inactive(), 0);
        assert!(registry.is_user_online("u1"));
    }

    #[test]
    fn indices_stay_consistent_under_concurrent_churn() {
        use std::thread;

        let registry = Arc::new(ConnectionRegistry::default());
        let mut handles = Vec::new();

        for t in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let conn_id = format!("conn_{t}_{i}");
                    // Threads share identities to force fan-out set contention.
                    let user_id = format!("u{}", t % 4);
                    let (tx, _rx) = mpsc::channel(1);
                    registry.add_client(Connection {
                        connection_id: conn_id.clone(),
                        identity: Some(Identity {
                            id: user_id,
                            display_name: String::new(),
                            roles: Vec::new(),
                        }),
                        sender: tx,
                    });
                    if i % 2 == 0 {
                        registry.remove_client(&conn_id);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        registry.assert_indices_consistent();
        // 8 threads × 100 surviving connections each.
        assert_eq!(registry.online_connection_count(), 800);
        assert_eq!(registry.online_user_count(), 4);
    }
}
