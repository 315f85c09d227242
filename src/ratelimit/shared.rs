//! Redis-backed shared window store.
//!
//! Every window is a Redis sorted set whose members are attempts scored by
//! their timestamp. A call runs as a single `MULTI`/`EXEC` pipeline (or a Lua
//! script for conditional recording), so processes sharing the instance see
//! one consistent order of adds and prunes per key.
//!
//! The connection is opened lazily and reopened after failures, which lets a
//! process start while Redis is down and pick it back up once it returns.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::key::LimitKey;
use super::store::WindowStore;
use super::window::{ttl_seconds, WindowSample};
use crate::error::{Result, WindowGateError};

/// Prune, count, and record only when below the limit, as one atomic unit.
const RECORD_IF_BELOW: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local cutoff = ARGV[2]
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. cutoff)
local count = redis.call('ZCARD', key)
local recorded = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  count = count + 1
  recorded = 1
end
redis.call('EXPIRE', key, ttl)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {count, recorded, oldest[2] or ''}
"#;

/// Configuration for the shared store.
#[derive(Debug, Clone)]
pub struct SharedStoreConfig {
    /// Redis connection URL (e.g. "redis://127.0.0.1/")
    pub url: String,
    /// Prefix prepended to every limit key
    pub key_prefix: String,
    /// Upper bound for a single store call, connecting included
    pub timeout: Duration,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            key_prefix: "windowgate:".to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

/// Window store shared between processes through Redis.
pub struct SharedWindowStore {
    client: Client,
    connection: Mutex<Option<ConnectionManager>>,
    record_if_below: Script,
    config: SharedStoreConfig,
}

impl fmt::Debug for SharedWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWindowStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SharedWindowStore {
    /// Create a store for the configured URL.
    ///
    /// Only the URL is validated here; no connection is made until the
    /// first call.
    pub fn new(config: SharedStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            record_if_below: Script::new(RECORD_IF_BELOW),
            config,
        })
    }

    /// Create a store and connect eagerly.
    pub async fn connect(config: SharedStoreConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.bounded(async { store.connection().await.map(|_| ()) }).await?;
        Ok(store)
    }

    pub fn config(&self) -> &SharedStoreConfig {
        &self.config
    }

    fn redis_key(&self, key: &LimitKey) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new(self.client.clone()).await?;
        info!(url = %self.config.url, "Connected to shared window store");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection so the next call reconnects.
    ///
    /// Skipped when another call holds the slot, which means it is already
    /// reconnecting.
    fn reset_connection(&self) {
        if let Ok(mut slot) = self.connection.try_lock() {
            slot.take();
        }
    }

    /// Run `op` under the configured timeout, mapping every failure to
    /// `StoreUnavailable`.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = match tokio::time::timeout(self.config.timeout, op).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => WindowGateError::StoreUnavailable(e.to_string()),
            Err(_) => WindowGateError::StoreUnavailable(format!(
                "timed out after {}ms",
                self.config.timeout.as_millis()
            )),
        };
        debug!(error = %outcome, "Shared window store call failed");
        self.reset_connection();
        Err(outcome)
    }
}

fn member(now: f64) -> String {
    format!("{}-{}", now, Uuid::new_v4())
}

fn parse_score(raw: &str) -> Option<f64> {
    raw.parse().ok()
}

#[async_trait]
impl WindowStore for SharedWindowStore {
    async fn record_and_count(&self, key: &LimitKey, now: f64, period: Duration) -> Result<WindowSample> {
        let redis_key = self.redis_key(key);
        let cutoff = now - period.as_secs_f64();
        let ttl = ttl_seconds(period) as i64;

        let (count, oldest): (u64, Vec<(String, f64)>) = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let reply = redis::pipe()
                    .atomic()
                    .zadd(&redis_key, member(now), now)
                    .ignore()
                    .zrembyscore(&redis_key, "-inf", format!("({}", cutoff))
                    .ignore()
                    .zcard(&redis_key)
                    .zrange_withscores(&redis_key, 0, 0)
                    .expire(&redis_key, ttl)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, WindowGateError>(reply)
            })
            .await?;

        trace!(key = %key, count = count, "Recorded attempt in shared window");

        Ok(WindowSample {
            count,
            oldest: oldest.first().map(|(_, score)| *score),
            recorded: true,
        })
    }

    async fn record_if_below(
        &self,
        key: &LimitKey,
        now: f64,
        period: Duration,
        limit: u64,
    ) -> Result<WindowSample> {
        let redis_key = self.redis_key(key);
        let cutoff = now - period.as_secs_f64();
        let ttl = ttl_seconds(period);

        let (count, recorded, oldest): (u64, u64, String) = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let reply = self
                    .record_if_below
                    .key(&redis_key)
                    .arg(now.to_string())
                    .arg(cutoff.to_string())
                    .arg(limit)
                    .arg(member(now))
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, WindowGateError>(reply)
            })
            .await?;

        trace!(
            key = %key,
            count = count,
            recorded = recorded == 1,
            "Conditionally recorded attempt in shared window"
        );

        Ok(WindowSample {
            count,
            oldest: parse_score(&oldest),
            recorded: recorded == 1,
        })
    }

    async fn drop_key(&self, key: &LimitKey) -> Result<()> {
        let redis_key = self.redis_key(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            conn.del::<_, ()>(&redis_key).await?;
            Ok::<_, WindowGateError>(())
        })
        .await
    }

    async fn size(&self, key: &LimitKey) -> Result<u64> {
        let redis_key = self.redis_key(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let count: u64 = conn.zcard(&redis_key).await?;
            Ok::<_, WindowGateError>(count)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
