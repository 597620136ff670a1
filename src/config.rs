//! Configuration for the tracker connection, retry behavior and batch
//! execution.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Tracker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Base URL of the tracker (e.g. `https://tracker.example.com`).
    pub base_url: String,

    /// API key used for Basic authentication.
    pub api_key: String,

    /// Basic auth user name paired with the API key.
    #[serde(default = "default_basic_user")]
    pub basic_user: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Path to the logical-field-name → tracker-field-id override file.
    #[serde(default)]
    pub field_overrides_path: Option<PathBuf>,

    /// Path to the field-id → {value → option href} override file.
    #[serde(default)]
    pub option_overrides_path: Option<PathBuf>,
}

fn default_basic_user() -> String {
    "apikey".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl TrackerConfig {
    /// Create a config with the given base URL and API key.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            basic_user: default_basic_user(),
            timeout_secs: default_timeout_secs(),
            field_overrides_path: None,
            option_overrides_path: None,
        }
    }

    /// Load from environment variables.
    ///
    /// Reads `ORDERSYNC_BASE_URL`, `ORDERSYNC_API_KEY` and the optional
    /// `ORDERSYNC_BASIC_USER`, `ORDERSYNC_FIELD_OVERRIDES_PATH` and
    /// `ORDERSYNC_OPTION_OVERRIDES_PATH`.
    pub fn from_env() -> SyncResult<Self> {
        let base_url = std::env::var("ORDERSYNC_BASE_URL").map_err(|_| {
            SyncError::Configuration {
                message: "ORDERSYNC_BASE_URL is not set".to_string(),
            }
        })?;
        let api_key =
            std::env::var("ORDERSYNC_API_KEY").map_err(|_| SyncError::Configuration {
                message: "ORDERSYNC_API_KEY is not set".to_string(),
            })?;
        let mut config = Self::new(base_url, api_key);
        if let Ok(user) = std::env::var("ORDERSYNC_BASIC_USER") {
            config.basic_user = user;
        }
        if let Ok(path) = std::env::var("ORDERSYNC_FIELD_OVERRIDES_PATH") {
            config.field_overrides_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("ORDERSYNC_OPTION_OVERRIDES_PATH") {
            config.option_overrides_path = Some(PathBuf::from(path));
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the field-id override file path.
    #[must_use]
    pub fn with_field_overrides(mut self, path: impl Into<PathBuf>) -> Self {
        self.field_overrides_path = Some(path.into());
        self
    }

    /// Set the option override file path.
    #[must_use]
    pub fn with_option_overrides(mut self, path: impl Into<PathBuf>) -> Self {
        self.option_overrides_path = Some(path.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::Configuration {
                message: "base_url must not be empty".to_string(),
            });
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(SyncError::Configuration {
                message: format!("base_url must be http(s): {}", self.base_url),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(SyncError::Configuration {
                message: "api_key must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Retry behavior for tracker mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call.
    ///
    /// Total attempts = `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on the backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Whether to add jitter to backoff delays.
    #[serde(default = "default_use_jitter")]
    pub use_jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_use_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            use_jitter: default_use_jitter(),
        }
    }
}

impl RetryConfig {
    /// Create a retry config with the given retry budget.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Disable retries entirely.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the initial backoff delay.
    #[must_use]
    pub fn with_backoff_base(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    /// Disable jitter (deterministic delays for tests).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Backoff delay before the given retry.
    ///
    /// `attempt` is 1-based: the delay after the first failed call is
    /// `backoff_base_ms`, doubling per subsequent attempt, capped at
    /// `max_backoff_ms`, with up to 25% jitter when enabled.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponential = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.max_backoff_ms);
        let delay_ms = if self.use_jitter {
            capped + jitter_ms(capped / 4)
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }
}

/// Pseudo-random jitter in `0..=bound` milliseconds, derived from the
/// nanosecond clock.
fn jitter_ms(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    u64::from(nanos) % (bound + 1)
}

/// Batch execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of concurrent workers processing distinct orders.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Shared quota on concurrent tracker calls across all workers.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Whether resolved entities get an update when their fields drifted.
    #[serde(default = "default_update_existing")]
    pub update_existing: bool,

    /// Optional batch deadline in seconds.
    ///
    /// When the deadline passes, no new orders are scheduled; work
    /// already in flight runs to completion.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_workers() -> usize {
    4
}

fn default_max_concurrent_requests() -> usize {
    8
}

fn default_update_existing() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_concurrent_requests: default_max_concurrent_requests(),
            update_existing: default_update_existing(),
            deadline_secs: None,
        }
    }
}

impl SyncConfig {
    /// Set the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the shared request quota.
    #[must_use]
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max.max(1);
        self
    }

    /// Set the batch deadline.
    #[must_use]
    pub fn with_deadline(mut self, secs: u64) -> Self {
        self.deadline_secs = Some(secs);
        self
    }
}
