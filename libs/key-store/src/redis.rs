//! Redis / KeyDB backed [`KeyStore`].
//!
//! Records are JSON strings stored with a millisecond expiry. The free-key
//! index is a sorted set scored by each record's creation time. Every write
//! that can change lease state runs as a Lua script so the value and the index
//! move together. Each call is bounded by the configured timeout.
//!
//! All keys touched by one script must hash to the same slot on a cluster
//! deployment; use a hash tag in both the key prefix and the index key if
//! running against Redis Cluster.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, LuaInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy};
use fred::types::{Builder, CustomCommand};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::models::{self, CodecError, LeaseRecord};
use crate::{Expiry, KeyStore};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: usize = 4;
/// Default name of the free-key sorted set.
pub const DEFAULT_FREE_INDEX_KEY: &str = "keylease:free";

// KEYS[1] record, KEYS[2] free index
// ARGV[1] value, ARGV[2] ttl ms, ARGV[3] leased flag, ARGV[4] score
const PUT_SCRIPT: &str = r#"
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    if ARGV[3] == '1' then
        redis.call('ZREM', KEYS[2], KEYS[1])
    else
        redis.call('ZADD', KEYS[2], ARGV[4], KEYS[1])
    end
    return 1
"#;

// KEYS[1] record, KEYS[2] free index
// ARGV[1] expected, ARGV[2] new, ARGV[3] ttl ms or 'keep', ARGV[4] leased flag, ARGV[5] score
const CAS_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if not current or current ~= ARGV[1] then
        return 0
    end
    if ARGV[3] == 'keep' then
        redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    else
        redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    end
    if ARGV[4] == '1' then
        redis.call('ZREM', KEYS[2], KEYS[1])
    else
        redis.call('ZADD', KEYS[2], ARGV[5], KEYS[1])
    end
    return 1
"#;

// KEYS[1] record, KEYS[2] free index
const DELETE_SCRIPT: &str = r#"
    local deleted = redis.call('DEL', KEYS[1])
    redis.call('ZREM', KEYS[2], KEYS[1])
    return deleted
"#;

// KEYS[1] record, KEYS[2] free index
// ARGV[1] expected value, ARGV[2] score
const REINDEX_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if not current or current ~= ARGV[1] then
        return 0
    end
    return redis.call('ZADD', KEYS[2], 'NX', ARGV[2], KEYS[1])
"#;

#[derive(Debug, Error)]
pub enum RedisError {
    #[error("redis error: {0}")]
    Transport(#[from] fred::error::Error),
    #[error("redis {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// `redis://[:password@]host:port[/db]`
    pub url: String,
    pub pool_size: usize,
    /// bound on every individual store call
    pub timeout: Duration,
    /// sorted set holding free keys
    pub free_index_key: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_TIMEOUT,
            free_index_key: DEFAULT_FREE_INDEX_KEY.to_owned(),
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
    free_index_key: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .field("free_index_key", &self.free_index_key)
            .finish()
    }
}

impl RedisStore {
    /// Build a pool, connect it and verify with a PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self, RedisError> {
        let fred_config = FredConfig::from_url(&config.url)?;
        let mut builder = Builder::from_config(fred_config);
        // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
        let pool = builder.build_pool(config.pool_size)?;

        let store = Self {
            pool,
            timeout: config.timeout,
            free_index_key: config.free_index_key.clone(),
        };
        store.timed("connect", store.pool.init()).await?;
        let _: String = store.timed("ping", store.pool.ping(None)).await?;

        info!(
            pool_size = config.pool_size,
            timeout = ?config.timeout,
            free_index_key = %config.free_index_key,
            "redis pool created and verified"
        );
        Ok(store)
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, RedisError>
    where
        F: Future<Output = Result<T, fred::error::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => {
                warn!(op, after = ?self.timeout, "redis call timed out");
                Err(RedisError::Timeout {
                    op,
                    after: self.timeout,
                })
            }
        }
    }

    async fn script(
        &self,
        op: &'static str,
        script: &'static str,
        key: &str,
        args: Vec<String>,
    ) -> Result<i64, RedisError> {
        let keys = vec![key.to_owned(), self.free_index_key.clone()];
        self.timed(op, self.pool.eval(script, keys, args)).await
    }
}

fn leased_flag(record: &LeaseRecord) -> String {
    if record.is_leased { "1" } else { "0" }.to_owned()
}

fn ttl_arg(ttl: Duration) -> String {
    // PX must be positive
    ttl.as_millis().max(1).to_string()
}

/// Escape glob metacharacters so a prefix matches literally in KEYS.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

/// Map a PTTL reply. -2 means missing, -1 means no expiry.
fn pttl_to_remaining(key: &str, pttl: i64) -> Option<Duration> {
    match pttl {
        -2 => None,
        -1 => {
            warn!(key, "entry has no expiry, treating remaining lifetime as zero");
            Some(Duration::ZERO)
        }
        ms => Some(Duration::from_millis(ms.max(0) as u64)),
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    type Error = RedisError;

    async fn put(
        &self,
        key: &str,
        record: &LeaseRecord,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        let value = models::encode(record)?;
        let args = vec![
            value,
            ttl_arg(ttl),
            leased_flag(record),
            record.free_score().to_string(),
        ];
        self.script("put", PUT_SCRIPT, key, args).await?;
        trace!(key, ?ttl, "redis put");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, Self::Error> {
        let value: Option<String> = self.timed("get", self.pool.get(key)).await?;
        match value {
            Some(value) => Ok(Some(models::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &LeaseRecord,
        new: &LeaseRecord,
        expiry: Expiry,
    ) -> Result<bool, Self::Error> {
        let ttl = match expiry {
            Expiry::Keep => "keep".to_owned(),
            Expiry::In(ttl) => ttl_arg(ttl),
        };
        let args = vec![
            models::encode(expected)?,
            models::encode(new)?,
            ttl,
            leased_flag(new),
            new.free_score().to_string(),
        ];
        let swapped = self.script("compare_and_swap", CAS_SCRIPT, key, args).await? == 1;
        trace!(key, swapped, "redis compare_and_swap");
        Ok(swapped)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let pttl: i64 = self.timed("pttl", self.pool.pttl(key)).await?;
        Ok(pttl_to_remaining(key, pttl))
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let deleted = self.script("delete", DELETE_SCRIPT, key, Vec::new()).await?;
        Ok(deleted > 0)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        let keys: Vec<String> = self
            .timed(
                "keys",
                self.pool.custom(
                    CustomCommand::new_static("KEYS", None::<u16>, false),
                    vec![glob_escape(prefix)],
                ),
            )
            .await?;
        debug!(prefix, count = keys.len(), "listed keys");
        Ok(keys
            .into_iter()
            .filter(|key| *key != self.free_index_key)
            .collect())
    }

    async fn free_candidates(&self, limit: usize) -> Result<Vec<String>, Self::Error> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = (limit - 1).to_string();
        self.timed(
            "zrange",
            self.pool.custom(
                CustomCommand::new_static("ZRANGE", None::<u16>, false),
                vec![self.free_index_key.clone(), "0".to_owned(), stop],
            ),
        )
        .await
    }

    async fn forget_free(&self, key: &str) -> Result<(), Self::Error> {
        let _: i64 = self
            .timed(
                "zrem",
                self.pool.custom(
                    CustomCommand::new_static("ZREM", None::<u16>, false),
                    vec![self.free_index_key.clone(), key.to_owned()],
                ),
            )
            .await?;
        Ok(())
    }

    async fn reindex_free(&self, key: &str, record: &LeaseRecord) -> Result<bool, Self::Error> {
        if record.is_leased {
            return Ok(false);
        }
        let args = vec![models::encode(record)?, record.free_score().to_string()];
        let added = self.script("reindex_free", REINDEX_SCRIPT, key, args).await? == 1;
        trace!(key, added, "redis reindex_free");
        Ok(added)
    }
}
