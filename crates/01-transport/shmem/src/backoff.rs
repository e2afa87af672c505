//! Backoff tuning, cooperative cancellation and polling helpers for bounded waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{ShmemError, ShmemResult};

/// Timing knobs shared by every condition wait.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    /// Length of one native poll for spin-backed conditions.
    #[serde(with = "millis")]
    pub spin_poll: Duration,
    /// Failed polls retried with only a yield in between.
    pub immediate_retries: u32,
    /// Failed polls (counted from the start) after which sleeps switch to `long_sleep`.
    pub short_sleep_retries: u32,
    #[serde(with = "millis")]
    pub short_sleep: Duration,
    #[serde(with = "millis")]
    pub long_sleep: Duration,
    /// Longest single blocking call for OS-backed conditions.
    #[serde(with = "millis")]
    pub os_slice: Duration,
    /// Minimum spacing between wait ticks (liveness checks).
    #[serde(with = "millis")]
    pub tick_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            spin_poll: Duration::from_millis(10),
            immediate_retries: 20,
            short_sleep_retries: 80,
            short_sleep: Duration::from_millis(5),
            long_sleep: Duration::from_millis(100),
            os_slice: Duration::from_secs(1),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Escalating pause schedule: yield, then short sleeps, then long sleeps.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a WaitPolicy,
    attempts: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a WaitPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Pause for the next attempt; `Duration::ZERO` means yield only.
    pub fn next_pause(&mut self) -> Duration {
        let attempt = self.attempts;
        self.attempts = self.attempts.saturating_add(1);
        if attempt < self.policy.immediate_retries {
            Duration::ZERO
        } else if attempt < self.policy.short_sleep_retries {
            self.policy.short_sleep
        } else {
            self.policy.long_sleep
        }
    }

    /// Sleeps for the next pause, never past `remaining`.
    pub fn snooze(&mut self, remaining: Duration) {
        let pause = self.next_pause().min(remaining);
        if pause.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(pause);
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Shared flag that aborts in-progress waits with [`ShmemError::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> ShmemResult<()> {
        if self.is_cancelled() {
            return Err(ShmemError::Cancelled);
        }
        Ok(())
    }
}

/// Time left until `deadline`; `None` deadlines never expire.
pub(crate) fn remaining(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |deadline| {
        deadline.saturating_duration_since(Instant::now())
    })
}

/// Polls `predicate` every `interval` until it holds or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. The predicate is always evaluated at least once.
pub fn poll_until<F>(
    timeout: Duration,
    interval: Duration,
    cancel: Option<&CancelToken>,
    mut predicate: F,
) -> ShmemResult<bool>
where
    F: FnMut() -> ShmemResult<bool>,
{
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        if predicate()? {
            return Ok(true);
        }
        let left = remaining(deadline);
        if left.is_zero() {
            return Ok(false);
        }
        thread::sleep(interval.min(left));
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
