//! Counting algorithms.
//!
//! Each algorithm consumes one unit against a keyed quota and reports the
//! outcome as a [`RateLimitResult`]. Window algorithms only write to the store
//! when the request is admitted; the token bucket always persists its state.
//!
//! The read and the increment are separate store calls, so concurrent
//! requests for one key can admit slightly more than the limit. Only the
//! increment itself is atomic.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::key::CounterKey;
use super::result::RateLimitResult;
use super::rules::Quota;
use crate::store::{CounterStore, StoreError, StoreResult};

/// The counting strategy applied to every quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per aligned window. Bursts straddling a boundary can reach
    /// twice the limit.
    FixedWindow,
    /// Current window count plus the previous window's count weighted by the
    /// part of it still inside the sliding window.
    #[default]
    SlidingWindow,
    /// Tokens refill continuously at `limit / window`, up to `limit + burst`.
    TokenBucket,
}

impl Algorithm {
    /// Consume one unit of `quota` for `key` at wall time `now`.
    pub async fn check(
        &self,
        store: &dyn CounterStore,
        now: Duration,
        key: &CounterKey,
        quota: &Quota,
    ) -> StoreResult<RateLimitResult> {
        let now_ms = now.as_millis() as u64;
        let result = match self {
            Algorithm::FixedWindow => fixed_window(store, now_ms, key, quota).await?,
            Algorithm::SlidingWindow => sliding_window(store, now_ms, key, quota).await?,
            Algorithm::TokenBucket => token_bucket(store, now_ms, key, quota).await?,
        };

        trace!(
            algorithm = %self,
            key = %key,
            allowed = result.allowed,
            remaining = result.remaining,
            "Quota checked"
        );

        Ok(result)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        };
        f.write_str(name)
    }
}

/// Window boundaries for a point in time.
struct WindowPosition {
    index: u64,
    window_ms: u64,
    elapsed_ms: u64,
}

impl WindowPosition {
    fn at(now_ms: u64, window: Duration) -> Self {
        let window_ms = duration_ms(window).max(1);
        let index = now_ms / window_ms;
        Self {
            index,
            window_ms,
            elapsed_ms: now_ms - index * window_ms,
        }
    }

    fn end_ms(&self) -> u64 {
        self.index.saturating_add(1).saturating_mul(self.window_ms)
    }

    fn until_end(&self) -> Duration {
        Duration::from_millis(self.window_ms - self.elapsed_ms)
    }
}

/// Milliseconds in `d`, clamped to `u64::MAX`.
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn millis_to_unix_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

async fn read_count(store: &dyn CounterStore, key: &str) -> StoreResult<u64> {
    match store.get(key).await? {
        Some(value) => value
            .parse::<i64>()
            .map(|n| n.max(0) as u64)
            .map_err(|_| StoreError::NotAnInteger),
        None => Ok(0),
    }
}

/// Increment a window counter, setting `ttl` only when the key is new so the
/// window's life is never extended.
async fn increment_window(
    store: &dyn CounterStore,
    key: &str,
    ttl: Duration,
) -> StoreResult<u64> {
    let count = store.increment(key, 1).await?;
    if count == 1 {
        store.set_ttl(key, ttl).await?;
    }
    Ok(count.max(0) as u64)
}

fn result(key: &CounterKey, quota: &Quota) -> RateLimitResult {
    RateLimitResult {
        allowed: false,
        limit: quota.limit,
        remaining: 0,
        reset_at: 0,
        retry_after: None,
        limit_type: key.limit_type,
        limit_key: key.masked(),
    }
}

async fn fixed_window(
    store: &dyn CounterStore,
    now_ms: u64,
    key: &CounterKey,
    quota: &Quota,
) -> StoreResult<RateLimitResult> {
    let position = WindowPosition::at(now_ms, quota.window);
    let store_key = key.window(position.index);

    let mut outcome = result(key, quota);
    outcome.reset_at = millis_to_unix_secs(position.end_ms());

    let count = read_count(store, &store_key).await?;
    if count < quota.limit {
        let count = increment_window(store, &store_key, quota.window).await?;
        outcome.allowed = true;
        outcome.remaining = quota.limit.saturating_sub(count);
    } else {
        outcome.retry_after = Some(position.until_end());
    }

    Ok(outcome)
}

async fn sliding_window(
    store: &dyn CounterStore,
    now_ms: u64,
    key: &CounterKey,
    quota: &Quota,
) -> StoreResult<RateLimitResult> {
    let position = WindowPosition::at(now_ms, quota.window);
    let current_key = key.window(position.index);

    let previous = match position.index.checked_sub(1) {
        Some(index) => read_count(store, &key.window(index)).await?,
        None => 0,
    };
    let current = read_count(store, &current_key).await?;

    let overlap = 1.0 - position.elapsed_ms as f64 / position.window_ms as f64;
    let weighted_previous = previous as f64 * overlap;
    let limit = quota.limit as f64;

    let mut outcome = result(key, quota);
    outcome.reset_at = millis_to_unix_secs(position.end_ms());

    if weighted_previous + (current as f64) < limit {
        // The current count must survive one more window as the "previous" one.
        let ttl = quota.window.saturating_mul(2);
        let current = increment_window(store, &current_key, ttl).await?;
        outcome.allowed = true;
        outcome.remaining = (limit - weighted_previous - current as f64).floor().max(0.0) as u64;
    } else {
        outcome.retry_after = Some(position.until_end());
    }

    Ok(outcome)
}

/// Persisted token bucket state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

async fn token_bucket(
    store: &dyn CounterStore,
    now_ms: u64,
    key: &CounterKey,
    quota: &Quota,
) -> StoreResult<RateLimitResult> {
    let store_key = key.bucket();
    let capacity = quota.limit.saturating_add(quota.burst) as f64;
    let window_ms = duration_ms(quota.window).max(1) as f64;
    let limit = quota.limit as f64;

    // Milliseconds needed to refill `tokens`, None when nothing ever refills.
    let refill_time =
        |tokens: f64| (limit > 0.0).then(|| (tokens * window_ms / limit).ceil() as u64);

    let state = match store.get(&store_key).await? {
        Some(raw) => match serde_json::from_str::<BucketState>(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable token bucket state");
                None
            }
        },
        None => None,
    };

    let mut tokens = match state {
        Some(state) => {
            let elapsed = now_ms.saturating_sub(state.last_refill_ms) as f64;
            (state.tokens + elapsed * limit / window_ms).min(capacity)
        }
        None => capacity,
    };

    let mut outcome = result(key, quota);
    if tokens >= 1.0 {
        tokens -= 1.0;
        outcome.allowed = true;
    } else {
        let wait = refill_time(1.0 - tokens).map_or(quota.window, Duration::from_millis);
        outcome.retry_after = Some(wait);
    }
    outcome.remaining = tokens.floor().max(0.0) as u64;

    let refill_ms = refill_time(capacity - tokens).unwrap_or(window_ms as u64);
    outcome.reset_at = millis_to_unix_secs(now_ms.saturating_add(refill_ms));

    let state = BucketState {
        tokens,
        last_refill_ms: now_ms,
    };
    let encoded =
        serde_json::to_string(&state).map_err(|e| StoreError::Backend(e.to_string()))?;
    store
        .set(&store_key, &encoded, Duration::from_millis(refill_ms.max(1)))
        .await?;

    Ok(outcome)
}
