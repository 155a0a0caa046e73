//! Configuration for the coordination substrate.
//!
//! All policy constants can be set via environment variables:
//! - `SWARMDESK_RETRY_CEILING` - Optional. Blocked-transition count after which a goal
//!   is escalated instead of blocked again. Defaults to `2`.
//! - `SWARMDESK_MAX_ATTEMPTS` - Optional. Maximum attempts per recovered operation
//!   (initial call included). Defaults to `3`.
//! - `SWARMDESK_BASE_DELAY_MS` - Optional. Base backoff delay for transient faults.
//!   Defaults to `500`.
//! - `SWARMDESK_MAX_DELAY_MS` - Optional. Backoff cap. Defaults to `30000`.
//! - `SWARMDESK_RESOURCE_FLOOR_MS` - Optional. Minimum backoff for rate-limit style
//!   faults without a retry-after hint. Defaults to `5000`.
//! - `SWARMDESK_BREAKER_THRESHOLD` - Optional. Consecutive failures that open a
//!   circuit. Defaults to `5`.
//! - `SWARMDESK_BREAKER_COOLDOWN_MS` - Optional. Open-circuit cool-down before a
//!   half-open trial is allowed. Defaults to `60000`.
//! - `SWARMDESK_HISTORY_LIMIT` - Optional. Per-agent message history ring size.
//!   Defaults to `256`.
//! - `SWARMDESK_RETENTION_SECS` - Optional. Age after which terminal goals become
//!   eligible for archival. Defaults to `86400`.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Goal lifecycle policy.
#[derive(Debug, Clone)]
pub struct GoalConfig {
    /// Blocked transitions beyond this count auto-escalate instead.
    pub retry_ceiling: u32,

    /// How long terminal goals are retained before `archive` may evict them.
    pub retention: Duration,
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 2,
            retention: Duration::from_secs(86_400),
        }
    }
}

/// Retry, backoff and circuit-breaker policy for fallible operations.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum attempts per operation, the initial call included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff on transient faults.
    pub base_delay: Duration,

    /// Cap applied to any computed backoff delay.
    pub max_delay: Duration,

    /// Minimum delay for resource-exhausted faults without a retry-after hint.
    pub resource_floor: Duration,

    /// Consecutive failures that flip a circuit from closed to open.
    pub breaker_threshold: u32,

    /// Cool-down an open circuit waits before allowing a half-open trial.
    pub breaker_cooldown: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            resource_floor: Duration::from_secs(5),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// Message hub policy.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-agent history ring buffer size.
    pub history_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { history_limit: 256 }
    }
}

/// Top-level configuration, one section per core service.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub goals: GoalConfig,
    pub recovery: RecoveryConfig,
    pub hub: HubConfig,
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_env::<u32>("SWARMDESK_RETRY_CEILING")? {
            config.goals.retry_ceiling = v;
        }
        if let Some(v) = parse_env::<u64>("SWARMDESK_RETENTION_SECS")? {
            config.goals.retention = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u32>("SWARMDESK_MAX_ATTEMPTS")? {
            config.recovery.max_attempts = v.max(1);
        }
        if let Some(v) = parse_env::<u64>("SWARMDESK_BASE_DELAY_MS")? {
            config.recovery.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>("SWARMDESK_MAX_DELAY_MS")? {
            config.recovery.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>("SWARMDESK_RESOURCE_FLOOR_MS")? {
            config.recovery.resource_floor = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u32>("SWARMDESK_BREAKER_THRESHOLD")? {
            config.recovery.breaker_threshold = v.max(1);
        }
        if let Some(v) = parse_env::<u64>("SWARMDESK_BREAKER_COOLDOWN_MS")? {
            config.recovery.breaker_cooldown = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<usize>("SWARMDESK_HISTORY_LIMIT")? {
            config.hub.history_limit = v.max(1);
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(None),
    }
}
