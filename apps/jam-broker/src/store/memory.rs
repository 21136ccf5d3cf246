use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RecordStore, SessionQuery, SessionRecord, StoreError};

/// In-memory adapter for tests and offline runs.
///
/// The session collection is `None` until the first insert and again after a
/// drop, mirroring a document store where dropping removes the collection.
#[derive(Default)]
pub struct InMemoryRecordStore {
    accounts: Mutex<HashMap<String, BTreeSet<String>>>,
    sessions: Mutex<Option<BTreeMap<String, SessionRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn has_session_collection(&self) -> bool {
        self.sessions.lock().await.is_some()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn add_session_to_account(
        &self,
        account_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.accounts
            .lock()
            .await
            .entry(account_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        Ok(())
    }

    async fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut guard = self.sessions.lock().await;
        let sessions = guard.get_or_insert_with(BTreeMap::new);
        if sessions.contains_key(&record.id) {
            return Err(StoreError::DuplicateSession(record.id));
        }
        sessions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn find_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>, StoreError> {
        let guard = self.sessions.lock().await;
        Ok(guard
            .iter()
            .flat_map(|sessions| sessions.values())
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }

    async fn remove_session(&self, account_id: &str, session_id: &str) -> Result<(), StoreError> {
        if let Some(sessions) = self.sessions.lock().await.as_mut() {
            sessions.remove(session_id);
        }
        if let Some(sessions) = self.accounts.lock().await.get_mut(account_id) {
            sessions.remove(session_id);
        }
        Ok(())
    }

    async fn account_sessions(&self, account_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .accounts
            .lock()
            .await
            .get(account_id)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn drop_sessions(&self) -> Result<(), StoreError> {
        self.sessions.lock().await.take();
        Ok(())
    }

    async fn clear_account_sessions(&self) -> Result<(), StoreError> {
        for sessions in self.accounts.lock().await.values_mut() {
            sessions.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, title: &str, account: &str) -> SessionRecord {
        SessionRecord::new(id, title, "", 1, "127.0.0.1", account)
    }

    #[test_timeout::tokio_timeout_test]
    async fn inserts_and_finds_sessions() {
        let store = InMemoryRecordStore::new();
        assert!(!store.has_session_collection().await);

        store.insert_session(record("a", "One", "acct1")).await.unwrap();
        store.insert_session(record("b", "Two", "acct2")).await.unwrap();

        let all = store.find_sessions(&SessionQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let mine = store
            .find_sessions(&SessionQuery {
                name: None,
                account_id: Some("acct2".into()),
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "b");
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_session_insert_fails() {
        let store = InMemoryRecordStore::new();
        store.insert_session(record("a", "One", "acct1")).await.unwrap();

        let err = store
            .insert_session(record("a", "Again", "acct1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSession(id) if id == "a"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn account_sets_deduplicate_and_reset() {
        let store = InMemoryRecordStore::new();
        store.add_session_to_account("acct1", "a").await.unwrap();
        store.add_session_to_account("acct1", "a").await.unwrap();
        store.add_session_to_account("acct1", "b").await.unwrap();
        assert_eq!(store.account_sessions("acct1").await.unwrap(), vec!["a", "b"]);

        store.clear_account_sessions().await.unwrap();
        assert!(store.account_sessions("acct1").await.unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn remove_session_withdraws_document_and_membership() {
        let store = InMemoryRecordStore::new();
        store.insert_session(record("a", "One", "acct1")).await.unwrap();
        store.insert_session(record("b", "Two", "acct1")).await.unwrap();
        store.add_session_to_account("acct1", "a").await.unwrap();
        store.add_session_to_account("acct1", "b").await.unwrap();

        store.remove_session("acct1", "a").await.unwrap();
        store.remove_session("acct9", "zzz").await.unwrap();

        let left = store.find_sessions(&SessionQuery::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "b");
        assert_eq!(store.account_sessions("acct1").await.unwrap(), vec!["b"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remove_session_does_not_recreate_a_dropped_collection() {
        let store = InMemoryRecordStore::new();
        store.insert_session(record("a", "One", "acct1")).await.unwrap();
        store.drop_sessions().await.unwrap();

        store.remove_session("acct1", "a").await.unwrap();
        assert!(!store.has_session_collection().await);
    }

    #[test_timeout::tokio_timeout_test]
    async fn drop_removes_collection() {
        let store = InMemoryRecordStore::new();
        store.insert_session(record("a", "One", "acct1")).await.unwrap();
        store.drop_sessions().await.unwrap();

        assert!(!store.has_session_collection().await);
        assert!(store
            .find_sessions(&SessionQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
