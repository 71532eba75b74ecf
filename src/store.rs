//! Access to the shared key-value store.
//!
//! The same store backs the server registry (two address sets) and the
//! status cache (one JSON result per address plus the request counter).
//! A single `Arc<dyn Store>` is built at startup and handed to every
//! component; all concurrency reduces to atomic single-key operations.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::StoreError;
use crate::models::{CheckKind, CheckResult};

pub const REQUEST_COUNTER_KEY: &str = "mcapi";

/// Key under which the latest result for `address` is stored.
pub fn result_key(kind: CheckKind, address: &str) -> String {
    format!("{}:{}", kind.as_str(), address)
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError>;
    async fn add_member(&self, set: &str, member: &str) -> Result<(), StoreError>;
    async fn remove_member(&self, set: &str, member: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Reads an integer key; a missing key counts as zero.
    async fn get_counter(&self, key: &str) -> Result<i64, StoreError>;
}

pub async fn connect(url: &str) -> Result<Arc<dyn Store>, StoreError> {
    if url.starts_with("memory://") {
        info!("Using in-process store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(url).await?;
    info!("Connected to store at {}", url);
    Ok(Arc::new(store))
}

/// Typed view of the status cache on top of a raw store.
#[derive(Clone)]
pub struct StatusCache {
    store: Arc<dyn Store>,
}

impl StatusCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn registry(&self, kind: CheckKind) -> Result<Vec<String>, StoreError> {
        self.store.members(kind.registry_set()).await
    }

    pub async fn put_result(&self, result: &CheckResult) -> Result<(), StoreError> {
        let raw = serde_json::to_string(result)?;
        self.store.set(&result_key(result.kind, &result.address), &raw).await
    }

    pub async fn get_result(&self, kind: CheckKind, address: &str) -> Result<Option<CheckResult>, StoreError> {
        let key = result_key(kind, address);
        match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { key, source }),
            None => Ok(None),
        }
    }

    pub async fn bump_requests(&self) -> Result<i64, StoreError> {
        self.store.incr(REQUEST_COUNTER_KEY).await
    }

    pub async fn requests(&self) -> Result<i64, StoreError> {
        self.store.get_counter(REQUEST_COUNTER_KEY).await
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(set).await?)
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(set, member).await?;
        Ok(())
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(set, member).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }
}

#[derive(Default)]
struct MemoryState {
    sets: HashMap<String, HashSet<String>>,
    values: HashMap<String, String>,
}

/// In-process store. Used with `memory://` and throughout the tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        state.sets.entry(set.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if let Some(members) = state.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        Ok(self.state.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.state.lock().await.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        let current = match state.values.get(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| StoreError::Unavailable(format!("value at {} is not an integer: {}", key, e)))?,
            None => 0,
        };
        let next = current + 1;
        state.values.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, StoreError> {
        self.check_online()?;
        let state = self.state.lock().await;
        match state.values.get(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| StoreError::Unavailable(format!("value at {} is not an integer: {}", key, e))),
            None => Ok(0),
        }
    }
}
