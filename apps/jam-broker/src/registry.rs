use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::gauge;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type ConnectionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("sessions were purged while session {0} was connecting")]
    Purged(String),
}

/// Handle to a live control connection.
///
/// Frames pushed through [`Connection::send`] are queued for the connection's
/// writer task; the handle never touches the socket directly.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    established_at: SystemTime,
    sender: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        sender: mpsc::Sender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            established_at: SystemTime::now(),
            sender,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn established_at(&self) -> SystemTime {
        self.established_at
    }

    pub fn send(&self, frame: Bytes) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.sender.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("established_at", &self.established_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Live session id to control connection mapping.
///
/// An entry exists exactly while the session is reachable. The epoch counter
/// moves on every [`SessionRegistry::clear`]; callers that suspend between
/// deciding to register and registering pass the epoch they started under.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: DashMap<String, Connection>,
    next_connection_id: AtomicU64,
    epoch: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Starts a new epoch without touching live connections.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register(
        &self,
        session_id: &str,
        connection: Connection,
        epoch: u64,
    ) -> Result<(), RegisterError> {
        if self.epoch() != epoch {
            connection.close();
            return Err(RegisterError::Purged(session_id.to_string()));
        }

        let id = connection.id();
        if let Some(previous) = self.connections.insert(session_id.to_string(), connection) {
            warn!(
                session_id,
                previous_connection = previous.id(),
                "replacing existing control connection"
            );
            previous.close();
        }

        // A purge may have run between the check above and the insert.
        if self.epoch() != epoch {
            if let Some((_, connection)) = self
                .connections
                .remove_if(session_id, |_, current| current.id() == id)
            {
                connection.close();
            }
            self.publish_gauge();
            return Err(RegisterError::Purged(session_id.to_string()));
        }

        self.publish_gauge();
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Connection> {
        self.connections
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    pub fn remove(&self, session_id: &str) -> Option<Connection> {
        let removed = self.connections.remove(session_id).map(|(_, conn)| conn);
        if let Some(connection) = &removed {
            connection.close();
            self.publish_gauge();
        }
        removed
    }

    /// Removes the entry only if it still belongs to `connection_id`, so a
    /// connection winding down cannot evict its replacement.
    pub fn remove_if_current(&self, session_id: &str, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(session_id, |_, current| current.id() == connection_id)
            .is_some();
        if removed {
            self.publish_gauge();
        }
        removed
    }

    pub fn list_active(&self) -> Vec<(String, Connection)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes and forgets every connection and starts a new epoch.
    pub fn clear(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let session_ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0usize;
        for session_id in session_ids {
            if let Some((_, connection)) = self.connections.remove(&session_id) {
                connection.close();
                closed += 1;
            }
        }
        self.publish_gauge();
        if closed > 0 {
            info!(closed, "cleared live session registry");
        }
        closed
    }

    fn publish_gauge(&self) {
        gauge!("jam_broker_sessions_live", self.connections.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    fn connection(registry: &SessionRegistry) -> (Connection, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let peer = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 25052));
        let conn = Connection::new(
            registry.next_connection_id(),
            peer,
            tx,
            CancellationToken::new(),
        );
        (conn, rx)
    }

    #[test_timeout::timeout]
    fn registers_and_snapshots_connections() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = connection(&registry);
        registry.register("abc", conn, registry.epoch()).unwrap();

        assert!(registry.contains("abc"));
        let snapshot = registry.list_active();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "abc");

        registry.remove("abc");
        assert_eq!(snapshot.len(), 1, "snapshot is not a live view");
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn second_registration_replaces_and_closes_first() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = connection(&registry);
        let (second, _rx2) = connection(&registry);
        let first_handle = first.clone();
        let second_id = second.id();

        registry.register("abc", first, registry.epoch()).unwrap();
        registry.register("abc", second, registry.epoch()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("abc").unwrap().id(), second_id);
        assert!(first_handle.is_closed());
    }

    #[test_timeout::timeout]
    fn stale_connection_cannot_evict_replacement() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = connection(&registry);
        let (second, _rx2) = connection(&registry);
        let first_id = first.id();

        registry.register("abc", first, registry.epoch()).unwrap();
        registry.register("abc", second, registry.epoch()).unwrap();

        assert!(!registry.remove_if_current("abc", first_id));
        assert!(registry.contains("abc"));
    }

    #[test_timeout::timeout]
    fn clear_closes_everything_and_rejects_stale_epochs() {
        let registry = SessionRegistry::new();
        let epoch = registry.epoch();
        let (live, _rx1) = connection(&registry);
        let live_handle = live.clone();
        registry.register("abc", live, epoch).unwrap();

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert!(live_handle.is_closed());

        let (late, _rx2) = connection(&registry);
        let late_handle = late.clone();
        let err = registry.register("def", late, epoch).unwrap_err();
        assert_eq!(err, RegisterError::Purged("def".into()));
        assert!(late_handle.is_closed());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn advancing_the_epoch_keeps_live_connections() {
        let registry = SessionRegistry::new();
        let epoch = registry.epoch();
        let (live, _rx1) = connection(&registry);
        registry.register("abc", live, epoch).unwrap();

        assert_eq!(registry.advance_epoch(), epoch + 1);
        assert!(registry.contains("abc"));

        let (late, _rx2) = connection(&registry);
        assert!(registry.register("def", late, epoch).is_err());
    }

    #[test_timeout::timeout]
    fn send_reports_queue_state() {
        let (tx, rx) = mpsc::channel(1);
        let peer = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        let conn = Connection::new(1, peer, tx, CancellationToken::new());

        assert_eq!(conn.send(Bytes::from_static(b"1:{}")), Ok(()));
        assert_eq!(conn.send(Bytes::from_static(b"2:{}")), Err(SendError::Full));
        drop(rx);
        assert_eq!(conn.send(Bytes::from_static(b"3:{}")), Err(SendError::Closed));
    }
}
