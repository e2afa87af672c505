//! Tunables for channels. Every field has a default, so partial JSON configs work.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shmem::{millis, LockStrategy, WaitPolicy};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Condition backing used when creating a channel. Openers follow the creator.
    pub lock_strategy: LockStrategy,
    pub wait: WaitPolicy,
    /// How often `connect` re-reads the server pid.
    #[serde(with = "millis")]
    pub connect_poll: Duration,
    /// Upper bound on waiting for in-flight operations during close.
    #[serde(with = "millis")]
    pub close_timeout: Duration,
    #[serde(with = "millis")]
    pub close_poll: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            lock_strategy: LockStrategy::Spin,
            wait: WaitPolicy::default(),
            connect_poll: Duration::from_millis(50),
            close_timeout: Duration::from_secs(5),
            close_poll: Duration::from_millis(25),
        }
    }
}

impl ChannelConfig {
    pub fn with_lock_strategy(mut self, lock_strategy: LockStrategy) -> Self {
        self.lock_strategy = lock_strategy;
        self
    }
}
