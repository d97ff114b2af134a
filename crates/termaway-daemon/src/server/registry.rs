use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use termaway_protocol::{ClientEntry, ServerFrame};

use crate::session::state::ClientId;

/// Per-connection bookkeeping shared across tasks.
///
/// The outbound sender feeds the connection's writer task; cancelling the
/// token tears the whole connection down (read loop, writer, forward task).
pub struct ClientHandle {
    pub tx: UnboundedSender<ServerFrame>,
    pub authenticated: bool,
    /// Heartbeat liveness flag: cleared on each tick, set on `pong`.
    pub alive: bool,
    pub remote_addr: String,
    pub connected_at: String,
    /// Name of the session this client is attached to, if any.
    pub attached: Option<String>,
    /// Live-output forward task for the current attachment. Aborted when
    /// the client detaches, re-attaches, or its session is torn down.
    pub forward: Option<tokio::task::JoinHandle<()>>,
    pub cancel: CancellationToken,
}

/// Registry of live connections, keyed by `ClientId`.
///
/// The single place state-change events fan out from: session-list
/// broadcasts, client-connected/disconnected events, clipboard updates.
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientHandle>,
    next_id: ClientId,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn register(
        &mut self,
        tx: UnboundedSender<ServerFrame>,
        remote_addr: String,
        connected_at: String,
        authenticated: bool,
        cancel: CancellationToken,
    ) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(
            id,
            ClientHandle {
                tx,
                authenticated,
                alive: true,
                remote_addr,
                connected_at,
                attached: None,
                forward: None,
                cancel,
            },
        );
        debug!(event = "daemon.registry.client_registered", client_id = id);
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientHandle> {
        let handle = self.clients.remove(&id);
        if handle.is_some() {
            debug!(event = "daemon.registry.client_removed", client_id = id);
        }
        handle
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientHandle> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientHandle> {
        self.clients.get_mut(&id)
    }

    pub fn set_authenticated(&mut self, id: ClientId) {
        if let Some(handle) = self.clients.get_mut(&id) {
            handle.authenticated = true;
        }
    }

    pub fn is_authenticated(&self, id: ClientId) -> bool {
        self.clients.get(&id).is_some_and(|h| h.authenticated)
    }

    pub fn set_attached(&mut self, id: ClientId, session: Option<String>) {
        if let Some(handle) = self.clients.get_mut(&id) {
            handle.attached = session;
        }
    }

    pub fn attached_session(&self, id: ClientId) -> Option<String> {
        self.clients.get(&id).and_then(|h| h.attached.clone())
    }

    pub fn set_alive(&mut self, id: ClientId, alive: bool) {
        if let Some(handle) = self.clients.get_mut(&id) {
            handle.alive = alive;
        }
    }

    /// Number of connections in the `Authenticated` state.
    pub fn authenticated_count(&self) -> usize {
        self.clients.values().filter(|h| h.authenticated).count()
    }

    /// Send a frame to one client. Delivery failure just means the writer
    /// task is already gone; the connection's own cleanup handles removal.
    pub fn send_to(&self, id: ClientId, frame: ServerFrame) {
        if let Some(handle) = self.clients.get(&id) {
            let _ = handle.tx.send(frame);
        }
    }

    /// Send a frame to a specific set of clients.
    pub fn send_to_clients(&self, ids: &[ClientId], frame: &ServerFrame) {
        for id in ids {
            if let Some(handle) = self.clients.get(id) {
                let _ = handle.tx.send(frame.clone());
            }
        }
    }

    /// Send a frame to every authenticated connection.
    pub fn broadcast_to_authenticated(&self, frame: &ServerFrame) {
        for handle in self.clients.values().filter(|h| h.authenticated) {
            let _ = handle.tx.send(frame.clone());
        }
    }

    /// Send a frame to every authenticated connection except `skip`.
    pub fn broadcast_to_authenticated_except(&self, skip: ClientId, frame: &ServerFrame) {
        for (id, handle) in self.clients.iter().filter(|(_, h)| h.authenticated) {
            if *id != skip {
                let _ = handle.tx.send(frame.clone());
            }
        }
    }

    /// Clear the attachment of every client attached to `session`, returning
    /// the affected client ids.
    pub fn clear_attachments_to(&mut self, session: &str) -> Vec<ClientId> {
        let mut cleared = Vec::new();
        for (id, handle) in self.clients.iter_mut() {
            if handle.attached.as_deref() == Some(session) {
                handle.attached = None;
                if let Some(forward) = handle.forward.take() {
                    forward.abort();
                }
                cleared.push(*id);
            }
        }
        cleared
    }

    /// Re-key the attachment of every client attached to `old` onto `new`.
    pub fn rekey_attachments(&mut self, old: &str, new: &str) {
        for handle in self.clients.values_mut() {
            if handle.attached.as_deref() == Some(old) {
                handle.attached = Some(new.to_string());
            }
        }
    }

    /// Enumerate authenticated clients with indexes assigned in iteration
    /// order at the moment of the call. The index is NOT stable across
    /// calls; see `kick-client`.
    pub fn list_entries(&self) -> Vec<ClientEntry> {
        self.clients
            .values()
            .filter(|h| h.authenticated)
            .enumerate()
            .map(|(index, h)| ClientEntry {
                id: index,
                ip: h.remote_addr.clone(),
                connected_at: h.connected_at.clone(),
                session: h.attached.clone(),
            })
            .collect()
    }

    /// Resolve a `kick-client` index: the nth authenticated client in the
    /// same iteration order `list_entries` uses.
    pub fn client_by_index(&self, index: usize) -> Option<ClientId> {
        self.clients
            .iter()
            .filter(|(_, h)| h.authenticated)
            .nth(index)
            .map(|(id, _)| *id)
    }

    /// All client ids, for the heartbeat sweep.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a peer address: the bare IP with any IPv4-in-IPv6 mapping
/// stripped (`::ffff:192.0.2.1` → `192.0.2.1`).
pub fn normalize_remote_addr(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Whether a normalized remote address is loopback.
///
/// Loopback peers (a local companion process) are counted in `clientCount`
/// but excluded from client-connected/disconnected broadcasts.
pub fn is_loopback_addr(addr: &str) -> bool {
    addr.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn register_one(
        registry: &mut ClientRegistry,
        addr: &str,
        authenticated: bool,
    ) -> (ClientId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(
            tx,
            addr.to_string(),
            "2026-08-01T10:00:00Z".to_string(),
            authenticated,
            CancellationToken::new(),
        );
        (id, rx)
    }

    #[test]
    fn test_register_assigns_increasing_ids() {
        let mut registry = ClientRegistry::new();
        let (a, _rx_a) = register_one(&mut registry, "10.0.0.1", true);
        let (b, _rx_b) = register_one(&mut registry, "10.0.0.2", true);
        assert!(b > a);
    }

    #[test]
    fn test_authenticated_count_excludes_unauthenticated() {
        let mut registry = ClientRegistry::new();
        let (_a, _rx_a) = register_one(&mut registry, "10.0.0.1", true);
        let (b, _rx_b) = register_one(&mut registry, "10.0.0.2", false);
        assert_eq!(registry.authenticated_count(), 1);

        registry.set_authenticated(b);
        assert_eq!(registry.authenticated_count(), 2);
    }

    #[test]
    fn test_broadcast_skips_unauthenticated() {
        let mut registry = ClientRegistry::new();
        let (_a, mut rx_a) = register_one(&mut registry, "10.0.0.1", true);
        let (_b, mut rx_b) = register_one(&mut registry, "10.0.0.2", false);

        registry.broadcast_to_authenticated(&ServerFrame::Detached);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_except_skips_sender() {
        let mut registry = ClientRegistry::new();
        let (a, mut rx_a) = register_one(&mut registry, "10.0.0.1", true);
        let (_b, mut rx_b) = register_one(&mut registry, "10.0.0.2", true);

        registry.broadcast_to_authenticated_except(
            a,
            &ServerFrame::ClipboardUpdate {
                content: "x".to_string(),
            },
        );
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_clear_attachments_to() {
        let mut registry = ClientRegistry::new();
        let (a, _rx_a) = register_one(&mut registry, "10.0.0.1", true);
        let (b, _rx_b) = register_one(&mut registry, "10.0.0.2", true);
        registry.set_attached(a, Some("demo".to_string()));
        registry.set_attached(b, Some("other".to_string()));

        let mut cleared = registry.clear_attachments_to("demo");
        cleared.sort_unstable();
        assert_eq!(cleared, vec![a]);
        assert!(registry.attached_session(a).is_none());
        assert_eq!(registry.attached_session(b).as_deref(), Some("other"));
    }

    #[test]
    fn test_rekey_attachments() {
        let mut registry = ClientRegistry::new();
        let (a, _rx_a) = register_one(&mut registry, "10.0.0.1", true);
        registry.set_attached(a, Some("old".to_string()));
        registry.rekey_attachments("old", "new");
        assert_eq!(registry.attached_session(a).as_deref(), Some("new"));
    }

    #[test]
    fn test_list_entries_indexes_are_dense() {
        let mut registry = ClientRegistry::new();
        let (_a, _rx_a) = register_one(&mut registry, "10.0.0.1", true);
        let (_b, _rx_b) = register_one(&mut registry, "10.0.0.2", false);
        let (_c, _rx_c) = register_one(&mut registry, "10.0.0.3", true);

        let entries = registry.list_entries();
        assert_eq!(entries.len(), 2);
        let mut indexes: Vec<usize> = entries.iter().map(|e| e.id).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn test_client_by_index_matches_list_order() {
        let mut registry = ClientRegistry::new();
        let (_a, _rx_a) = register_one(&mut registry, "10.0.0.1", true);
        let (_b, _rx_b) = register_one(&mut registry, "10.0.0.2", true);

        let entries = registry.list_entries();
        for entry in entries {
            let id = registry.client_by_index(entry.id).unwrap();
            let handle = registry.get(id).unwrap();
            assert_eq!(handle.remote_addr, entry.ip);
        }
        assert!(registry.client_by_index(2).is_none());
    }

    #[test]
    fn test_normalize_remote_addr_strips_v4_mapping() {
        let addr: SocketAddr = "[::ffff:192.0.2.1]:5000".parse().unwrap();
        assert_eq!(normalize_remote_addr(addr), "192.0.2.1");

        let addr: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        assert_eq!(normalize_remote_addr(addr), "192.0.2.1");

        let addr: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        assert_eq!(normalize_remote_addr(addr), "2001:db8::1");
    }

    #[test]
    fn test_is_loopback_addr() {
        assert!(is_loopback_addr("127.0.0.1"));
        assert!(is_loopback_addr("::1"));
        assert!(!is_loopback_addr("192.0.2.1"));
        assert!(!is_loopback_addr("not-an-ip"));
    }
}
