//! Durable session records.
//!
//! Two collections: per-account session sets and per-session documents. The
//! broker upserts into a set, inserts a document, withdraws an abandoned
//! session, queries, drops the session collection and resets every account's
//! set.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use self::memory::InMemoryRecordStore;
pub use self::redis::RedisRecordStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("session {0} already exists")]
    DuplicateSession(String),
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Milliseconds since the Unix epoch.
    pub start: u64,
    /// Declared duration in milliseconds. Not enforced by the broker.
    pub length: u64,
    pub address: String,
    pub accounts: Vec<String>,
}

impl SessionRecord {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        length_minutes: u32,
        address: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            start: now_millis(),
            length: u64::from(length_minutes) * 60 * 1000,
            address: address.into(),
            accounts: vec![account_id.into()],
        }
    }
}

/// Filter for [`RecordStore::find_sessions`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuery {
    pub name: Option<String>,
    pub account_id: Option<String>,
}

impl SessionQuery {
    pub fn matches(&self, record: &SessionRecord) -> bool {
        let name_matches = self
            .name
            .as_deref()
            .map_or(true, |name| record.title == name);
        let account_matches = self
            .account_id
            .as_deref()
            .map_or(true, |account| record.accounts.iter().any(|a| a == account));
        name_matches && account_matches
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Adds `session_id` to the account's session set, creating the account
    /// entry if needed.
    async fn add_session_to_account(
        &self,
        account_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError>;

    async fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError>;

    async fn find_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>, StoreError>;

    /// Withdraws a session that was never handed out: its document and the
    /// account's membership. Missing entries are not an error.
    async fn remove_session(&self, account_id: &str, session_id: &str) -> Result<(), StoreError>;

    async fn account_sessions(&self, account_id: &str) -> Result<Vec<String>, StoreError>;

    /// Removes the whole session collection.
    async fn drop_sessions(&self) -> Result<(), StoreError>;

    /// Empties every account's session set.
    async fn clear_account_sessions(&self) -> Result<(), StoreError>;
}

/// Redis when a URL is configured, otherwise a process-local store.
pub async fn connect(redis_url: Option<&str>) -> Result<Arc<dyn RecordStore>, StoreError> {
    match redis_url {
        Some(url) => {
            let store = RedisRecordStore::connect(url).await?;
            info!("using redis record store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no redis url configured; session records will not survive a restart");
            Ok(InMemoryRecordStore::new())
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
