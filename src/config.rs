//! Operator and per-controller configuration
//!
//! Settings are read from the process environment. Every controller gets an
//! immutable [`ControllerConfig`] derived from the operator-wide defaults.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default metrics listener address
pub const DEFAULT_METRICS_BIND: &str = ":8080";

/// Default interval between full resyncs
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Default number of retries before an item is dropped
pub const DEFAULT_JOB_RETRIES: u32 = 5;

/// Default image used for spawned jobs
pub const DEFAULT_JOB_IMAGE: &str = "vshn/wrestic:latest";

/// Reaction of the runtime when one controller terminates with an error
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Report the failure and keep the remaining controllers running
    #[default]
    ContinueOthers,
    /// Report the failure and stop every controller
    ShutdownAll,
}

impl std::str::FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "continue" | "continue-others" => Ok(FailurePolicy::ContinueOthers),
            "shutdown" | "shutdown-all" => Ok(FailurePolicy::ShutdownAll),
            other => Err(Error::config(format!(
                "Invalid failure policy '{}': must be one of: continue, shutdown",
                other
            ))),
        }
    }
}

/// Operator-wide settings
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Metrics listener address (`:8080` binds all interfaces)
    pub metrics_bind: String,
    /// Interval between full resyncs of every controller
    pub resync_period: Duration,
    /// Retries per work item before it is dropped
    pub job_retries: u32,
    /// Workers per controller
    pub concurrent_workers: usize,
    /// How long `stop` waits for controllers to drain
    pub shutdown_timeout: Duration,
    /// Reaction to a controller failing
    pub failure_policy: FailurePolicy,
    /// Image for spawned jobs
    pub job_image: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_bind: DEFAULT_METRICS_BIND.to_string(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            job_retries: DEFAULT_JOB_RETRIES,
            concurrent_workers: 1,
            shutdown_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::default(),
            job_image: DEFAULT_JOB_IMAGE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load the configuration from `BACKUP_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the configuration through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            metrics_bind: lookup("BACKUP_METRICBIND").unwrap_or(defaults.metrics_bind),
            resync_period: match lookup("BACKUP_RESYNC_PERIOD") {
                Some(v) => parse_duration(&v)?,
                None => defaults.resync_period,
            },
            job_retries: match lookup("BACKUP_JOB_RETRIES") {
                Some(v) => v.trim().parse().map_err(|e| {
                    Error::config(format!("Invalid BACKUP_JOB_RETRIES '{}': {}", v, e))
                })?,
                None => defaults.job_retries,
            },
            concurrent_workers: match lookup("BACKUP_CONCURRENT_WORKERS") {
                Some(v) => v.trim().parse().map_err(|e| {
                    Error::config(format!("Invalid BACKUP_CONCURRENT_WORKERS '{}': {}", v, e))
                })?,
                None => defaults.concurrent_workers,
            },
            shutdown_timeout: match lookup("BACKUP_SHUTDOWN_TIMEOUT") {
                Some(v) => parse_duration(&v)?,
                None => defaults.shutdown_timeout,
            },
            failure_policy: match lookup("BACKUP_FAILURE_POLICY") {
                Some(v) => v.parse()?,
                None => defaults.failure_policy,
            },
            job_image: lookup("BACKUP_IMAGE").unwrap_or(defaults.job_image),
        };

        config.controller("validation").validate()?;
        Ok(config)
    }

    /// Controller settings for the named resource kind
    pub fn controller(&self, name: &str) -> ControllerConfig {
        ControllerConfig::new(name)
            .with_max_retries(self.job_retries)
            .with_resync_interval(self.resync_period)
            .with_workers(self.concurrent_workers)
    }
}

/// Settings of one resource controller
///
/// Built once before the controller is constructed; the controller only
/// reads it afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    name: String,
    max_retries: u32,
    resync_interval: Duration,
    workers: usize,
}

impl ControllerConfig {
    /// Create a config with operator defaults for the given controller name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: DEFAULT_JOB_RETRIES,
            resync_interval: DEFAULT_RESYNC_PERIOD,
            workers: 1,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Controller name, used in logs and metric labels
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `ProcessingJobRetries`
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn resync_interval(&self) -> Duration {
        self.resync_interval
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Check the config can drive a controller
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Controller name must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::config(format!(
                "Controller '{}' needs at least one worker",
                self.name
            )));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::config(format!(
                "Controller '{}' resync interval must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Parse a duration such as `30s`, `5m`, `1h` or a plain number of seconds
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((idx, 's')) => (&value[..idx], 1),
        Some((idx, 'm')) => (&value[..idx], 60),
        Some((idx, 'h')) => (&value[..idx], 3600),
        _ => (value, 1),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| Error::config(format!("Invalid duration '{}'", value)))?;

    let seconds = amount
        .checked_mul(multiplier)
        .ok_or_else(|| Error::config(format!("Duration '{}' is too large", value)))?;

    Ok(Duration::from_secs(seconds))
}
