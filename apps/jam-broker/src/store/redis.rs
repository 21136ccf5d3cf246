use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::{RecordStore, SessionQuery, SessionRecord, StoreError};

const SESSION_INDEX_KEY: &str = "jam:sessions";
const ACCOUNT_KEY_PATTERN: &str = "jam:account:*:sessions";

fn session_key(session_id: &str) -> String {
    format!("jam:session:{session_id}")
}

fn account_key(account_id: &str) -> String {
    format!("jam:account:{account_id}:sessions")
}

/// Session documents live under `jam:session:{id}` as JSON, indexed by the
/// `jam:sessions` set. Account memberships are sets under
/// `jam:account:{id}:sessions`.
#[derive(Clone)]
pub struct RedisRecordStore {
    redis: ConnectionManager,
}

impl RedisRecordStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn add_session_to_account(
        &self,
        account_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.sadd(account_key(account_id), session_id).await?;
        Ok(())
    }

    async fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(&record)?;
        let created: bool = conn.set_nx(session_key(&record.id), serialized).await?;
        if !created {
            return Err(StoreError::DuplicateSession(record.id));
        }
        let _: () = conn.sadd(SESSION_INDEX_KEY, &record.id).await?;
        Ok(())
    }

    async fn find_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(SESSION_INDEX_KEY).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| session_key(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

        let mut records = Vec::new();
        for value in values.into_iter().flatten() {
            let record: SessionRecord = serde_json::from_str(&value)?;
            if query.matches(&record) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn remove_session(&self, account_id: &str, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .del(session_key(session_id))
            .ignore()
            .srem(SESSION_INDEX_KEY, session_id)
            .ignore()
            .srem(account_key(account_id), session_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn account_sessions(&self, account_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut sessions: Vec<String> = conn.smembers(account_key(account_id)).await?;
        sessions.sort();
        Ok(sessions)
    }

    async fn drop_sessions(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(SESSION_INDEX_KEY).await?;
        let mut keys: Vec<String> = ids.iter().map(|id| session_key(id)).collect();
        keys.push(SESSION_INDEX_KEY.to_string());
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn clear_account_sessions(&self) -> Result<(), StoreError> {
        let keys = self.scan_keys(ACCOUNT_KEY_PATTERN).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}
