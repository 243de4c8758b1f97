//! Wall-clock abstraction shared by the algorithms and the in-memory store.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, expressed as time since the Unix epoch.
///
/// Counter keys embed truncated window timestamps, so every process sharing a
/// store must agree on wall time; a monotonic `Instant` would not do.
pub trait Clock: Send + Sync + Debug {
    /// Current time since the Unix epoch.
    fn now(&self) -> Duration;

    /// Current time in whole milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the given time since the epoch.
    pub fn new(start: Duration) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis() as u64),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time since the epoch.
    pub fn set(&self, to: Duration) {
        self.millis.store(to.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
