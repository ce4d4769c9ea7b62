//! Session configuration.
//!
//! Configuration is layered with figment:
//! 1. built-in defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `CAM_ARBITER_`, nested with `__`
//!    (e.g. `CAM_ARBITER_CAPTURE__FRAME_RATE=30`).
//!
//! All durations are plain millisecond counts.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traits::CaptureSettings;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CAM_ARBITER_";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider failed or a value had the wrong type.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    /// A value was well-formed but unusable.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Top-level configuration for a [`CameraSession`](crate::CameraSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device index opened on first use (0 for /dev/video0).
    pub device_index: u32,
    /// How long a single-shot caller waits for a busy holder before reclaiming.
    pub access_timeout_ms: u64,
    /// Consecutive failed opens tolerated before opening is refused.
    pub max_init_attempts: u32,
    /// Parameters applied to every freshly opened device.
    pub capture: CaptureSettings,
    /// Warm-up performed after opening.
    pub warm_up: WarmUpPolicy,
    /// Retry and settle timing.
    pub retry: RetryPolicy,
    /// Streaming loop behaviour.
    pub stream: StreamConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            access_timeout_ms: 30_000,
            max_init_attempts: 5,
            capture: CaptureSettings::default(),
            warm_up: WarmUpPolicy::default(),
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Discard-and-retry reads performed before a new handle is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmUpPolicy {
    /// Pause after configuring, before the first read.
    pub settle_ms: u64,
    /// Reads attempted at most.
    pub max_reads: u32,
    /// Usable frames required for the device to count as ready.
    pub required_reads: u32,
    /// Pause between warm-up reads.
    pub read_interval_ms: u64,
}

impl Default for WarmUpPolicy {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            max_reads: 10,
            required_reads: 3,
            read_interval_ms: 200,
        }
    }
}

impl WarmUpPolicy {
    /// Settle delay as a [`Duration`].
    pub const fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Inter-read delay as a [`Duration`].
    pub const fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }
}

/// Bounded retries for reads and opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Reads attempted by a single-shot capture.
    pub read_attempts: u32,
    /// Pause after a failed single-shot read.
    pub read_backoff_ms: u64,
    /// Pause after a failed open.
    pub open_failure_backoff_ms: u64,
    /// Pause after closing a handle, letting the driver release resources.
    pub close_settle_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            read_attempts: 5,
            read_backoff_ms: 300,
            open_failure_backoff_ms: 1_000,
            close_settle_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Read backoff as a [`Duration`].
    pub const fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    /// Open-failure backoff as a [`Duration`].
    pub const fn open_failure_backoff(&self) -> Duration {
        Duration::from_millis(self.open_failure_backoff_ms)
    }

    /// Close settle delay as a [`Duration`].
    pub const fn close_settle(&self) -> Duration {
        Duration::from_millis(self.close_settle_ms)
    }
}

/// Streaming loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bad reads in a row after which the loop gives up.
    pub max_consecutive_failures: u32,
    /// Pause after a bad read.
    pub failure_backoff_ms: u64,
    /// Every n-th good frame is flagged for analysis.
    pub analysis_interval: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            failure_backoff_ms: 100,
            analysis_interval: 2,
        }
    }
}

impl StreamConfig {
    /// Failure backoff as a [`Duration`].
    pub const fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

impl SessionConfig {
    /// Load defaults overridden by environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Load defaults, then `path`, then environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Access timeout as a [`Duration`].
    pub const fn access_timeout(&self) -> Duration {
        Duration::from_millis(self.access_timeout_ms)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_init_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_init_attempts",
                reason: "must allow at least one attempt".to_owned(),
            });
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Invalid {
                field: "capture",
                reason: format!(
                    "resolution {}x{} is empty",
                    self.capture.width, self.capture.height
                ),
            });
        }
        if self.capture.frame_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "capture.frame_rate",
                reason: "must be positive".to_owned(),
            });
        }
        if self.warm_up.required_reads > self.warm_up.max_reads {
            return Err(ConfigError::Invalid {
                field: "warm_up.required_reads",
                reason: format!(
                    "{} required but only {} reads allowed",
                    self.warm_up.required_reads, self.warm_up.max_reads
                ),
            });
        }
        if self.retry.read_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.read_attempts",
                reason: "must allow at least one read".to_owned(),
            });
        }
        if self.stream.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                field: "stream.max_consecutive_failures",
                reason: "must be positive".to_owned(),
            });
        }
        Ok(())
    }

    /// Configuration with every delay removed, for tests.
    #[cfg(test)]
    pub(crate) fn immediate() -> Self {
        Self {
            access_timeout_ms: 200,
            warm_up: WarmUpPolicy {
                settle_ms: 0,
                read_interval_ms: 0,
                ..WarmUpPolicy::default()
            },
            retry: RetryPolicy {
                read_backoff_ms: 0,
                open_failure_backoff_ms: 0,
                close_settle_ms: 0,
                ..RetryPolicy::default()
            },
            stream: StreamConfig {
                failure_backoff_ms: 0,
                ..StreamConfig::default()
            },
            ..Self::default()
        }
    }
}
