use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;
use crate::jobs::DispatcherConfig;
use crate::retention::RetentionPolicy;

/// Job dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Host the session containers' published ports are reached on.
    pub host: String,
    pub timeout_secs: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Model used when a job request names none.
    pub default_model: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            timeout_secs: 3600,
            workers: 4,
            queue_capacity: 64,
            default_model: "gpt-4.1-mini".to_string(),
        }
    }
}

impl DispatchConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_string_env("DISPATCH_HOST", "127.0.0.1")?,
            timeout_secs: parse_optional_env("DISPATCH_TIMEOUT_SECS", 3600)?,
            workers: parse_optional_env("DISPATCH_WORKERS", 4)?,
            queue_capacity: parse_optional_env("DISPATCH_QUEUE_CAPACITY", 64)?,
            default_model: parse_string_env("DEFAULT_MODEL", "gpt-4.1-mini")?,
        })
    }

    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            host: self.host.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Age-based cleanup settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub session_max_age_hours: u64,
    pub job_max_age_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_max_age_hours: 24,
            job_max_age_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            session_max_age_hours: parse_optional_env("SESSION_MAX_AGE_HOURS", 24)?,
            job_max_age_hours: parse_optional_env("JOB_MAX_AGE_HOURS", 24)?,
            sweep_interval_secs: parse_optional_env("RETENTION_SWEEP_SECS", 3600)?,
        })
    }

    pub fn to_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            session_max_age: Duration::from_secs(self.session_max_age_hours * 3600),
            job_max_age: Duration::from_secs(self.job_max_age_hours * 3600),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}
