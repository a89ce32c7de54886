//! Engine configuration.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor applied per failed attempt
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Configuration for [`crate::DocEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of documents synced with the server at once
    pub concurrency: usize,

    /// Retry policy for storage and network failures
    pub backoff: BackoffConfig,

    /// Server rejections tolerated before a document error becomes sticky
    pub max_rejections: u32,

    /// Consecutive local write failures before they show up in `error_message`
    pub local_error_threshold: u32,

    /// Timeout applied to every server request
    pub request_timeout: Duration,

    /// Timeout applied to every storage call
    pub storage_timeout: Duration,

    /// Poll server clocks at this interval when the server has no push channel
    pub pull_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            backoff: BackoffConfig::default(),
            max_rejections: 3,
            local_error_threshold: 3,
            request_timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(10),
            pull_interval: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `DOCSYNC_*` environment variables.
    ///
    /// Unset variables keep their default.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = read_env::<usize>("DOCSYNC_CONCURRENCY")? {
            config.concurrency = value;
        }
        if let Some(value) = read_env::<u32>("DOCSYNC_MAX_REJECTIONS")? {
            config.max_rejections = value;
        }
        if let Some(value) = read_env::<u32>("DOCSYNC_LOCAL_ERROR_THRESHOLD")? {
            config.local_error_threshold = value;
        }
        if let Some(ms) = read_env::<u64>("DOCSYNC_BACKOFF_INITIAL_MS")? {
            config.backoff.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env::<u64>("DOCSYNC_BACKOFF_MAX_MS")? {
            config.backoff.max = Duration::from_millis(ms);
        }
        if let Some(value) = read_env::<f64>("DOCSYNC_BACKOFF_MULTIPLIER")? {
            config.backoff.multiplier = value;
        }
        if let Some(ms) = read_env::<u64>("DOCSYNC_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env::<u64>("DOCSYNC_STORAGE_TIMEOUT_MS")? {
            config.storage_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env::<u64>("DOCSYNC_PULL_INTERVAL_MS")? {
            config.pull_interval = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.backoff.initial.is_zero() {
            return Err(Error::InvalidConfig("backoff.initial must be positive".into()));
        }
        if self.backoff.max < self.backoff.initial {
            return Err(Error::InvalidConfig(
                "backoff.max must not be smaller than backoff.initial".into(),
            ));
        }
        if !(self.backoff.multiplier >= 1.0) {
            return Err(Error::InvalidConfig("backoff.multiplier must be >= 1".into()));
        }
        if self.max_rejections == 0 {
            return Err(Error::InvalidConfig("max_rejections must be at least 1".into()));
        }
        if self.request_timeout.is_zero() || self.storage_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be positive".into()));
        }
        if matches!(self.pull_interval, Some(interval) if interval.is_zero()) {
            return Err(Error::InvalidConfig("pull_interval must be positive".into()));
        }
        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}
