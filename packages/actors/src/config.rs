//! Environment-driven configuration for workers and runners.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const REQUERY_MS_VAR: &str = "QUEUE_REQUERY_MS";
pub const QUEUE_PATH_VAR: &str = "QUEUE_PATH";
pub const WORKERS_VAR: &str = "QUEUE_WORKERS";

/// Worker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Delay before re-reading the first pending job after losing a claim on
    /// the job that is still reported first.
    pub requery_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            requery_interval: Duration::from_millis(1000),
        }
    }
}

impl WorkerConfig {
    /// How often an idle worker looks for pending jobs on its own.
    pub fn with_requery_interval(mut self, interval: Duration) -> Self {
        self.requery_interval = interval;
        self
    }

    /// Read `QUEUE_REQUERY_MS`, falling back to the default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = env_parse::<u64>(REQUERY_MS_VAR)? {
            config.requery_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// Settings for a process hosting a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Base location of the queue in the store.
    pub queue_path: String,
    /// Number of workers to keep running.
    pub workers: usize,
    pub worker: WorkerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue_path: "jobs".to_string(),
            workers: 4,
            worker: WorkerConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Read `QUEUE_PATH`, `QUEUE_WORKERS` and the worker settings.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            queue_path: env_value(QUEUE_PATH_VAR).unwrap_or(defaults.queue_path),
            workers: env_parse(WORKERS_VAR)?.unwrap_or(defaults.workers),
            worker: WorkerConfig::from_env()?,
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_value(name)
        .map(|value| parse_value(name, value))
        .transpose()
}

fn parse_value<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}
