//! Runtime configuration of the saga engine.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default retry budget of the quota step.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("{var}: must be greater than zero")]
    Zero { var: &'static str },
}

/// Worker count of each per-step pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub validate: usize,
    pub sender_lock: usize,
    pub debit: usize,
    pub receiver_lock: usize,
    pub credit: usize,
    pub quota: usize,
    pub finalize: usize,
    pub compensation: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            validate: 3,
            sender_lock: 4,
            debit: 3,
            receiver_lock: 4,
            credit: 2,
            quota: 2,
            finalize: 2,
            compensation: 2,
        }
    }
}

/// Engine configuration.
///
/// Built with [`SagaConfig::default`] and the `with_*` methods, or read from
/// `TXS_SAGA_*` environment variables with [`SagaConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaConfig {
    pub max_retries: u32,
    pub step_timeout: Duration,
    pub retry_backoff: Duration,
    pub quota_capacity: usize,
    pub initial_quota_tokens: usize,
    pub quota_refill_interval: Option<Duration>,
    pub pools: PoolSizes,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            step_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(10),
            quota_capacity: 16,
            initial_quota_tokens: 1,
            quota_refill_interval: None,
            pools: PoolSizes::default(),
        }
    }
}

impl SagaConfig {
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Pool capacity and initial fill. The fill is clamped to the capacity.
    #[must_use]
    pub const fn with_quota(mut self, capacity: usize, initial_tokens: usize) -> Self {
        self.quota_capacity = capacity;
        self.initial_quota_tokens = initial_tokens;
        self
    }

    #[must_use]
    pub const fn with_quota_refill(mut self, interval: Duration) -> Self {
        self.quota_refill_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn with_pools(mut self, pools: PoolSizes) -> Self {
        self.pools = pools;
        self
    }

    /// Defaults overridden by any `TXS_SAGA_*` variable that is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(retries) = parse(&lookup, "TXS_SAGA_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TXS_SAGA_STEP_TIMEOUT_MS")? {
            if ms == 0 {
                return Err(ConfigError::Zero {
                    var: "TXS_SAGA_STEP_TIMEOUT_MS",
                });
            }
            config.step_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TXS_SAGA_RETRY_BACKOFF_MS")? {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse(&lookup, "TXS_SAGA_QUOTA_CAPACITY")? {
            config.quota_capacity = capacity;
        }
        if let Some(tokens) = parse(&lookup, "TXS_SAGA_QUOTA_TOKENS")? {
            config.initial_quota_tokens = tokens;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TXS_SAGA_QUOTA_REFILL_MS")? {
            // 0 disables the refill task
            config.quota_refill_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
