use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Queue configuration, loadable from `RELAYQ_`-prefixed environment
/// variables.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Database file path. When unset, an in-memory database is used.
    pub db_path: Option<String>,

    /// Maximum number of messages claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Messages released per throttle interval. When unset, a claimed batch
    /// is dispatched all at once.
    #[serde(default)]
    pub concurrency: Option<u32>,

    /// Interval between paced releases, in milliseconds.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// Flat backoff applied before a RETRY message becomes claimable again.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u32,

    /// Retry count at which a retryable failure becomes RETRIES_EXHAUSTED.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Staging directory for the overflow buffer.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
}

fn default_batch_size() -> u32 {
    50
}

fn default_throttle_ms() -> u64 {
    100
}

fn default_retry_interval_secs() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_staging_dir() -> String {
    "task-queue-messages".to_owned()
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(envy::prefixed("RELAYQ_").from_env::<Self>()?)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            batch_size: default_batch_size(),
            concurrency: None,
            throttle_ms: default_throttle_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            max_retries: default_max_retries(),
            staging_dir: default_staging_dir(),
        }
    }
}
