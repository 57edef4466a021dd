//! Durable pattern registry.
//!
//! The registry is the source of truth behind every prefix cache. It only
//! needs exact-key `get`/`set` from its backing [`Store`]; longest-prefix
//! resolution is built on top by probing shorter and shorter token prefixes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::{pattern, Result};

/// Exact-key storage behind a [`Registry`].
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value. No expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to redis and check the server answers.
    ///
    /// `url` is a `redis://[:password@]host:port/db` connection string.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "redis reachable");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }
}

/// In-process store. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A pattern resolved by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Stored key that matched.
    pub pattern: String,
    /// Service address stored under it.
    pub address: String,
}

/// Durable pattern-to-address registry.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("store", &self.store.name())
            .finish()
    }
}

impl Registry {
    /// Wrap a store.
    pub fn new(store: impl Store) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Persist `pattern -> address`, overwriting any previous address.
    pub async fn set(&self, pattern: &str, address: &str) -> Result<()> {
        self.store.set(pattern, address).await?;
        info!(%pattern, %address, store = self.store.name(), "pattern persisted");
        Ok(())
    }

    /// Longest stored pattern that is a token prefix of `pattern`.
    ///
    /// One store round trip per candidate prefix. A failed probe or an
    /// empty value is treated as a miss for that candidate.
    pub async fn longest_prefix_lookup(&self, pattern: &str) -> Option<Resolved> {
        for candidate in pattern::prefixes(pattern) {
            match self.store.get(candidate).await {
                Ok(Some(address)) if !address.is_empty() => {
                    debug!(%pattern, matched = %candidate, %address, "registry hit");
                    return Some(Resolved {
                        pattern: candidate.to_string(),
                        address,
                    });
                }
                Ok(_) => trace!(%candidate, "registry probe missed"),
                Err(err) => debug!(%candidate, error = %err, "registry probe failed"),
            }
        }
        debug!(%pattern, "registry miss");
        None
    }
}
