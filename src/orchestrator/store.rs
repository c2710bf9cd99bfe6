//! Persistence for checkpoints and sequences.
//!
//! Every record carries a `version`. Writes are compare-and-swap on that
//! version, serialized per key inside the process by [`KeyedLocks`] and
//! across processes by the backend (a Lua script in Redis, an entry lock in
//! the in-memory map). A write based on a stale read is rejected with
//! [`StoreError::Conflict`] and retried from a fresh read.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::errors::{OrchestratorError, StoreError};

/// Stored payload with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: u64,
    pub data: String,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Whether records survive a restart and are visible to other processes.
    fn is_durable(&self) -> bool;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn load(&self, namespace: &str, id: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Store `data` if the current version is `expected` (0 means absent).
    /// Returns the new version.
    async fn compare_and_swap(
        &self,
        namespace: &str,
        id: &str,
        expected: u64,
        data: &str,
    ) -> Result<u64, StoreError>;

    async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StoreError>;
}

// ── In-memory ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemoryRecord {
    stored: StoredRecord,
    expires_at: Option<Instant>,
}

impl MemoryRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local store. Not durable: nothing survives a restart and other
/// processes see nothing. With a TTL, a record lapses that long after its
/// last write, the same as in Redis.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: DashMap<(String, String), MemoryRecord>,
    ttl: Option<Duration>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero `ttl` keeps records for the life of the process.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl: (!ttl.is_zero()).then_some(ttl),
        }
    }

    fn fresh(&self, version: u64, data: &str) -> MemoryRecord {
        MemoryRecord {
            stored: StoredRecord {
                version,
                data: data.to_string(),
            },
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    /// Drop every lapsed record.
    fn prune(&self) {
        if self.ttl.is_some() {
            let now = Instant::now();
            self.records.retain(|_, r| r.is_live(now));
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load(&self, namespace: &str, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let key = (namespace.to_string(), id.to_string());
        let now = Instant::now();
        let live = self.records.get(&key).map(|r| (r.is_live(now), r.stored.clone()));
        match live {
            Some((true, stored)) => Ok(Some(stored)),
            Some((false, _)) => {
                self.records.remove_if(&key, |_, r| !r.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        id: &str,
        expected: u64,
        data: &str,
    ) -> Result<u64, StoreError> {
        let conflict = || StoreError::Conflict {
            key: format!("{}:{}", namespace, id),
        };
        match self.records.entry((namespace.to_string(), id.to_string())) {
            Entry::Occupied(mut entry) => {
                // A lapsed record counts as absent.
                let current = if entry.get().is_live(Instant::now()) {
                    entry.get().stored.version
                } else {
                    0
                };
                if current != expected {
                    return Err(conflict());
                }
                let version = expected + 1;
                entry.insert(self.fresh(version, data));
                Ok(version)
            }
            Entry::Vacant(entry) => {
                if expected != 0 {
                    return Err(conflict());
                }
                entry.insert(self.fresh(1, data));
                Ok(1)
            }
        }
    }

    async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        self.prune();
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().0 == namespace)
            .map(|r| r.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ── Redis ─────────────────────────────────────────────────────────────

/// KEYS[1] record hash, KEYS[2] namespace index set.
/// ARGV: expected version, data, ttl seconds, id.
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then current = '0' end
if current ~= ARGV[1] then return -1 end
local next = tonumber(ARGV[1]) + 1
redis.call('HSET', KEYS[1], 'version', next, 'data', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[4])
if tonumber(ARGV[3]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
  redis.call('EXPIRE', KEYS[2], ARGV[3])
end
return next
"#;

/// KEYS[1] namespace index set. ARGV[1] record key prefix.
/// Returns the ids whose record still exists and drops the rest.
const LIST_SCRIPT: &str = r#"
local live = {}
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. id) == 1 then
    table.insert(live, id)
  else
    redis.call('SREM', KEYS[1], id)
  end
end
return live
"#;

/// Redis-backed store. Each record is a hash `{version, data}` under
/// `<prefix>:<namespace>:<id>`; ids are indexed in `<prefix>:<namespace>:index`.
/// Records and the index expire `ttl_secs` after their last write; ids of
/// expired records are dropped from the index when it is listed.
pub struct RedisStateStore {
    conn: ConnectionManager,
    prefix: String,
    ttl_secs: u64,
    cas: redis::Script,
    list: redis::Script,
}

impl RedisStateStore {
    /// Connect and verify the server answers within `timeout`.
    pub async fn connect(
        url: &str,
        prefix: &str,
        ttl_secs: u64,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Backend(format!(
                    "no answer from {} within {}ms",
                    url,
                    timeout.as_millis()
                ))
            })??;
        let store = Self {
            conn,
            prefix: prefix.to_string(),
            ttl_secs,
            cas: redis::Script::new(CAS_SCRIPT),
            list: redis::Script::new(LIST_SCRIPT),
        };
        store.ping().await?;
        Ok(store)
    }

    fn key(&self, namespace: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, namespace, id)
    }

    fn index_key(&self, namespace: &str) -> String {
        format!("{}:{}:index", self.prefix, namespace)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn load(&self, namespace: &str, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let (version, data): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(self.key(namespace, id))
            .arg("version")
            .arg("data")
            .query_async(&mut conn)
            .await?;
        Ok(match (version, data) {
            (Some(version), Some(data)) => Some(StoredRecord { version, data }),
            _ => None,
        })
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        id: &str,
        expected: u64,
        data: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(namespace, id);
        let result: i64 = self
            .cas
            .key(&key)
            .key(self.index_key(namespace))
            .arg(expected)
            .arg(data)
            .arg(self.ttl_secs)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        if result < 0 {
            return Err(StoreError::Conflict { key });
        }
        Ok(result as u64)
    }

    async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = self
            .list
            .key(self.index_key(namespace))
            .arg(self.key(namespace, ""))
            .invoke_async(&mut conn)
            .await?;
        ids.sort();
        Ok(ids)
    }
}

// ── Per-key locking ───────────────────────────────────────────────────

const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Async mutex per key.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        if self.locks.len() > LOCK_PRUNE_THRESHOLD {
            self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        }
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

// ── Typed records ─────────────────────────────────────────────────────

pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAMESPACE: &'static str;

    fn id(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

const MAX_CAS_ATTEMPTS: usize = 5;

/// Typed view over a [`StateStore`] namespace.
pub struct Records<T> {
    store: Arc<dyn StateStore>,
    locks: KeyedLocks,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Records<T> {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
            _marker: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn encode(record: &T) -> Result<String, StoreError> {
        serde_json::to_string(record)
            .map_err(|e| StoreError::Backend(format!("encode {}: {}", record.id(), e)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        let Some(stored) = self.store.load(T::NAMESPACE, id).await? else {
            return Ok(None);
        };
        let mut record: T =
            serde_json::from_str(&stored.data).map_err(|source| StoreError::Corrupt {
                key: format!("{}:{}", T::NAMESPACE, id),
                source,
            })?;
        record.set_version(stored.version);
        Ok(Some(record))
    }

    pub async fn insert(&self, record: &mut T) -> Result<(), StoreError> {
        record.set_version(1);
        let data = Self::encode(record)?;
        self.store.compare_and_swap(T::NAMESPACE, record.id(), 0, &data).await?;
        Ok(())
    }

    /// Read-modify-write. `mutate` returns `false` to leave the record
    /// untouched. Returns `None` when the record does not exist.
    pub async fn update<F>(&self, id: &str, mut mutate: F) -> Result<Option<T>, OrchestratorError>
    where
        F: FnMut(&mut T) -> Result<bool, OrchestratorError> + Send,
    {
        let _guard = self.locks.lock(&format!("{}:{}", T::NAMESPACE, id)).await;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(mut record) = self.get(id).await? else {
                return Ok(None);
            };
            let expected = record.version();
            if !mutate(&mut record)? {
                return Ok(Some(record));
            }
            record.set_version(expected + 1);
            let data = Self::encode(&record)?;
            match self.store.compare_and_swap(T::NAMESPACE, id, expected, &data).await {
                Ok(_) => return Ok(Some(record)),
                Err(StoreError::Conflict { key }) => {
                    debug!(key = %key, attempt, "Version conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(namespace = T::NAMESPACE, id, "Gave up after repeated version conflicts");
        Err(StoreError::Conflict {
            key: format!("{}:{}", T::NAMESPACE, id),
        }
        .into())
    }

    /// All readable records in the namespace. Corrupt entries are skipped.
    pub async fn list(&self) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        for id in self.store.list_ids(T::NAMESPACE).await? {
            match self.get(&id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(
                    namespace = T::NAMESPACE,
                    id = %id,
                    error = %e,
                    "Skipping unreadable record"
                ),
            }
        }
        Ok(records)
    }
}
