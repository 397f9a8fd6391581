//! Shared application state and the per-connection push-event fan-out used
//! by the WebSocket Gateway.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cc_domain::config::Config;
use cc_providers::LlmRouter;
use cc_streamhub::StreamRegistry;
use cc_store::Store;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ws::protocol::PushMessage;

/// Shared services every WS handler and the Tool Loop operate on.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub llm: Arc<LlmRouter>,
    pub streams: Arc<StreamRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub attachments_root: PathBuf,
}

/// A connection-keyed broadcast bus for gateway-originated push events
/// (everything that isn't a per-turn stream event forwarded by
/// [`cc_streamhub::StreamRegistry`]). Each connection registers an outbound
/// channel on upgrade and tells the registry which session ids it's
/// watching; `broadcast_session` reaches only connections watching that
/// session, `broadcast_global` reaches every connection.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    senders: RwLock<HashMap<u64, mpsc::UnboundedSender<Value>>>,
    watches: RwLock<HashMap<u64, HashSet<String>>>,
    /// Stream Registry subscriptions a connection has registered, as
    /// `(session_id, subscriber_id)` pairs, so `unregister` can unwind them
    /// on disconnect per the Stream Registry's disconnect-cleanup contract.
    stream_subs: RwLock<HashMap<u64, Vec<(String, u64)>>>,
    /// Retry count negotiated via `config.init`, clamped to 0..=10. Absent
    /// connections (not yet negotiated) default to 0 — a single attempt.
    retry_counts: RwLock<HashMap<u64, u8>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            senders: RwLock::new(HashMap::new()),
            watches: RwLock::new(HashMap::new()),
            stream_subs: RwLock::new(HashMap::new()),
            retry_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection and return its id plus the receiving end
    /// of its outbound channel. Both pushes and direct request/response
    /// replies for this connection flow through the same channel, as
    /// already-serialized JSON, so the writer task only ever has to forward
    /// bytes in arrival order.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(id, tx);
        (id, rx)
    }

    /// Send a direct reply (a [`crate::ws::protocol::ServerResponse`] or any
    /// other serializable value) to one connection.
    pub fn send_direct<T: Serialize>(&self, conn_id: u64, value: &T) {
        if let Some(tx) = self.senders.read().get(&conn_id) {
            if let Ok(json) = serde_json::to_value(value) {
                let _ = tx.send(json);
            }
        }
    }

    pub fn unregister(&self, conn_id: u64) {
        self.senders.write().remove(&conn_id);
        self.watches.write().remove(&conn_id);
        self.stream_subs.write().remove(&conn_id);
        self.retry_counts.write().remove(&conn_id);
    }

    /// Record the retry count a connection negotiated via `config.init`,
    /// clamped to 0..=10.
    pub fn set_retry_count(&self, conn_id: u64, count: u8) {
        self.retry_counts.write().insert(conn_id, count.min(10));
    }

    /// The retry count a connection negotiated, or 0 if it never did.
    pub fn retry_count(&self, conn_id: u64) -> u8 {
        self.retry_counts.read().get(&conn_id).copied().unwrap_or(0)
    }

    /// Send one push event to a single connection (used by the Stream
    /// Registry fan-out, which targets the subscribing connection directly
    /// rather than every watcher of a session).
    pub fn push_event(&self, conn_id: u64, msg: PushMessage) {
        if let Some(tx) = self.senders.read().get(&conn_id) {
            if let Ok(json) = serde_json::to_value(&msg) {
                let _ = tx.send(json);
            }
        }
    }

    pub fn add_stream_sub(&self, conn_id: u64, session_id: String, subscriber_id: u64) {
        self.stream_subs.write().entry(conn_id).or_default().push((session_id, subscriber_id));
    }

    /// Remove and return every Stream Registry subscription a connection
    /// holds, so the caller can unsubscribe each one before dropping it.
    pub fn take_stream_subs(&self, conn_id: u64) -> Vec<(String, u64)> {
        self.stream_subs.write().remove(&conn_id).unwrap_or_default()
    }

    pub fn watch(&self, conn_id: u64, session_id: &str) {
        self.watches
            .write()
            .entry(conn_id)
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn unwatch(&self, conn_id: u64, session_id: &str) {
        if let Some(set) = self.watches.write().get_mut(&conn_id) {
            set.remove(session_id);
        }
    }

    /// Send to every registered connection, regardless of watch list.
    pub fn broadcast_global(&self, msg: PushMessage) {
        let Ok(json) = serde_json::to_value(&msg) else { return };
        for tx in self.senders.read().values() {
            let _ = tx.send(json.clone());
        }
    }

    /// Send only to connections currently watching `session_id`.
    pub fn broadcast_session(&self, session_id: &str, msg: PushMessage) {
        let Ok(json) = serde_json::to_value(&msg) else { return };
        let watches = self.watches.read();
        let senders = self.senders.read();
        for (conn_id, sessions) in watches.iter() {
            if sessions.contains(session_id) {
                if let Some(tx) = senders.get(conn_id) {
                    let _ = tx.send(json.clone());
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::GatewayEvent;

    fn push(event: GatewayEvent) -> PushMessage {
        PushMessage {
            push: true,
            session_id: None,
            event,
        }
    }

    #[tokio::test]
    async fn session_broadcast_reaches_only_watchers() {
        let reg = ConnectionRegistry::new();
        let (a_id, mut a_rx) = reg.register();
        let (b_id, mut b_rx) = reg.register();
        reg.watch(a_id, "s1");
        // b never watches s1.

        reg.broadcast_session("s1", push(GatewayEvent::SessionUpdated { session_id: "s1".into() }));

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
        let _ = b_id;
    }

    #[tokio::test]
    async fn global_broadcast_reaches_every_connection() {
        let reg = ConnectionRegistry::new();
        let (_a, mut a_rx) = reg.register();
        let (_b, mut b_rx) = reg.register();

        reg.broadcast_global(push(GatewayEvent::SettingsChanged { key: "default_model".into() }));

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unwatch_stops_further_session_delivery() {
        let reg = ConnectionRegistry::new();
        let (id, mut rx) = reg.register();
        reg.watch(id, "s1");
        reg.unwatch(id, "s1");

        reg.broadcast_session("s1", push(GatewayEvent::SessionUpdated { session_id: "s1".into() }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_connection_from_both_maps() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = reg.register();
        reg.watch(id, "s1");
        assert_eq!(reg.connection_count(), 1);

        reg.unregister(id);
        assert_eq!(reg.connection_count(), 0);
        // Broadcasting after unregister must not panic or resurrect it.
        reg.broadcast_session("s1", push(GatewayEvent::SessionUpdated { session_id: "s1".into() }));
    }

    #[tokio::test]
    async fn push_event_reaches_only_the_targeted_connection() {
        let reg = ConnectionRegistry::new();
        let (a_id, mut a_rx) = reg.register();
        let (_b_id, mut b_rx) = reg.register();

        reg.push_event(a_id, push(GatewayEvent::SessionUpdated { session_id: "s1".into() }));

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn take_stream_subs_drains_and_unregister_clears_them() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = reg.register();
        reg.add_stream_sub(id, "s1".into(), 1);
        reg.add_stream_sub(id, "s1".into(), 2);

        let subs = reg.take_stream_subs(id);
        assert_eq!(subs, vec![("s1".to_string(), 1), ("s1".to_string(), 2)]);
        assert!(reg.take_stream_subs(id).is_empty());
    }

    #[tokio::test]
    async fn retry_count_defaults_to_zero_and_clamps_at_ten() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = reg.register();
        assert_eq!(reg.retry_count(id), 0);

        reg.set_retry_count(id, 3);
        assert_eq!(reg.retry_count(id), 3);

        reg.set_retry_count(id, 200);
        assert_eq!(reg.retry_count(id), 10);
    }
}
