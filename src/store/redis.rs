//! Redis-backed counter store, shared across serving processes.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, RedisError};
use tracing::{debug, info};

use super::{CounterStore, StoreError, StoreResult};

/// Number of keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

/// Counter store backed by Redis (or any protocol-compatible server).
///
/// Every command is bounded by `response_timeout`; a command that runs past it
/// surfaces as [`StoreError::Timeout`].
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    response_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the server at `url` and verify it answers `PING`.
    pub async fn connect(url: &str, response_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;

        let connection = tokio::time::timeout(response_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(response_timeout))?
            .map_err(map_redis_error)?;

        let store = Self {
            connection,
            response_timeout,
        };

        let _: String = store.query(redis::cmd("PING")).await?;
        info!("Connected to Redis counter store");

        Ok(store)
    }

    async fn query<T: FromRedisValue>(&self, cmd: Cmd) -> StoreResult<T> {
        let mut conn = self.connection.clone();
        match tokio::time::timeout(self.response_timeout, cmd.query_async::<T>(&mut conn)).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(StoreError::Timeout(self.response_timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
        self.query(cmd).await
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(key).arg(delta);
        self.query(cmd).await
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_millis(ttl));
        let _: i64 = self.query(cmd).await?;
        Ok(())
    }

    async fn get_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let pttl: i64 = self.query(cmd).await?;
        Ok(ttl_from_pttl(pttl))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: i64 = self.query(cmd).await?;
        Ok(count > 0)
    }

    async fn delete_pattern(&self, pattern: &str) -> StoreResult<u64> {
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let mut scan = redis::cmd("SCAN");
            scan.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, keys): (u64, Vec<String>) = self.query(scan).await?;

            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                del.arg(&keys);
                let removed: i64 = self.query(del).await?;
                deleted += removed.max(0) as u64;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(deleted = deleted, "Deleted counters matching pattern");
        Ok(deleted)
    }
}

/// Redis rejects a zero expiry, so round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Translate a `PTTL` reply: `-2` means no key, `-1` means no expiry.
fn ttl_from_pttl(pttl: i64) -> Option<Duration> {
    if pttl < 0 {
        None
    } else {
        Some(Duration::from_millis(pttl as u64))
    }
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_timeout()
        || err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}
