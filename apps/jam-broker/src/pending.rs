use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::router::ResponseHandler;

/// A provisioned session waiting for its container to call back.
pub struct PendingHandshake {
    pub account_id: String,
    pub address: IpAddr,
    pub response_handler: Arc<dyn ResponseHandler>,
    pub created_at: Instant,
}

impl PendingHandshake {
    pub fn new(
        account_id: impl Into<String>,
        address: IpAddr,
        response_handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            address,
            response_handler,
            created_at: Instant::now(),
        }
    }
}

impl fmt::Debug for PendingHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingHandshake")
            .field("account_id", &self.account_id)
            .field("address", &self.address)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Session ids awaiting their first control-plane callback.
///
/// Entries are consumed exactly once: [`PendingHandshakes::take`] removes the
/// entry in the same map operation that returns it, so a duplicate callback
/// for the same id finds nothing.
#[derive(Debug, Default)]
pub struct PendingHandshakes {
    entries: DashMap<String, PendingHandshake>,
}

impl PendingHandshakes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an entry, replacing any earlier one for the same id.
    /// Returns `true` when an entry was replaced.
    pub fn insert(&self, session_id: impl Into<String>, handshake: PendingHandshake) -> bool {
        let session_id = session_id.into();
        let replaced = self.entries.insert(session_id.clone(), handshake).is_some();
        if replaced {
            warn!(session_id = %session_id, "replaced an unconsumed pending handshake");
        }
        self.publish_gauge();
        replaced
    }

    pub fn take(&self, session_id: &str) -> Option<PendingHandshake> {
        let taken = self.entries.remove(session_id).map(|(_, handshake)| handshake);
        if taken.is_some() {
            self.publish_gauge();
        }
        taken
    }

    /// Removes the entry only if it is still the one installed at `created_at`.
    pub fn withdraw(&self, session_id: &str, created_at: Instant) -> bool {
        let removed = self
            .entries
            .remove_if(session_id, |_, handshake| handshake.created_at == created_at)
            .is_some();
        if removed {
            self.publish_gauge();
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.publish_gauge();
        count
    }

    /// Drops entries older than `ttl` as of `now` and returns their ids.
    pub fn sweep_expired(&self, ttl: Duration, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        self.entries.retain(|session_id, handshake| {
            let keep = now.saturating_duration_since(handshake.created_at) <= ttl;
            if !keep {
                expired.push(session_id.clone());
            }
            keep
        });
        if !expired.is_empty() {
            counter!("jam_broker_pending_expired_total", expired.len() as u64);
            self.publish_gauge();
        }
        expired
    }

    pub fn spawn_sweeper(self: &Arc<Self>, ttl: Duration, interval: Duration) -> JoinHandle<()> {
        let table = Arc::clone(self);
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                for session_id in table.sweep_expired(ttl, Instant::now()) {
                    info!(
                        session_id = %session_id,
                        ttl_secs = ttl.as_secs(),
                        "pending handshake expired without a callback"
                    );
                }
            }
        })
    }

    fn publish_gauge(&self) {
        gauge!("jam_broker_pending_handshakes", self.entries.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::router::NoopResponseHandler;

    fn entry(account_id: &str) -> PendingHandshake {
        PendingHandshake::new(
            account_id,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Arc::new(NoopResponseHandler),
        )
    }

    #[test_timeout::timeout]
    fn entries_are_consumed_once() {
        let table = PendingHandshakes::new();
        assert!(!table.insert("abc", entry("acct1")));

        let taken = table.take("abc").unwrap();
        assert_eq!(taken.account_id, "acct1");
        assert!(table.take("abc").is_none());
        assert!(table.is_empty());
    }

    #[test_timeout::timeout]
    fn insert_keeps_one_entry_per_session() {
        let table = PendingHandshakes::new();
        table.insert("abc", entry("acct1"));
        assert!(table.insert("abc", entry("acct2")));

        assert_eq!(table.len(), 1);
        assert_eq!(table.take("abc").unwrap().account_id, "acct2");
    }

    #[test_timeout::timeout]
    fn withdraw_leaves_a_newer_entry_alone() {
        let table = PendingHandshakes::new();
        let first = entry("acct1");
        let first_at = first.created_at;
        table.insert("abc", first);
        let mut second = entry("acct2");
        second.created_at = first_at + Duration::from_millis(5);
        table.insert("abc", second);

        assert!(!table.withdraw("abc", first_at));
        assert_eq!(table.take("abc").unwrap().account_id, "acct2");

        let third = entry("acct3");
        let third_at = third.created_at;
        table.insert("abc", third);
        assert!(table.withdraw("abc", third_at));
        assert!(table.is_empty());
    }

    #[test_timeout::timeout]
    fn sweep_removes_only_stale_entries() {
        let table = PendingHandshakes::new();
        table.insert("old", entry("acct1"));
        table.insert("fresh", entry("acct2"));
        let now = Instant::now();
        if let Some(mut old) = table.entries.get_mut("old") {
            old.created_at = now - Duration::from_secs(120);
        }

        let expired = table.sweep_expired(Duration::from_secs(60), now);
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(table.contains("fresh"));
        assert!(!table.contains("old"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweeper_task_expires_entries() {
        let table = Arc::new(PendingHandshakes::new());
        table.insert("abc", entry("acct1"));

        let sweeper = table.spawn_sweeper(Duration::ZERO, Duration::from_millis(10));
        for _ in 0..100 {
            if table.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();
        assert!(table.is_empty());
    }
}
