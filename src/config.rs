use core::{num::NonZeroUsize, time::Duration};
use thiserror::Error;

/// Environment variable overriding [`ExecutorConfig::max_workers`].
pub const MAX_WORKERS_ENV: &str = "PLAN_EXECUTOR_MAX_WORKERS";
/// Environment variable overriding [`ExecutorConfig::health_grace_period`],
/// in milliseconds.
pub const HEALTH_GRACE_MS_ENV: &str = "PLAN_EXECUTOR_HEALTH_GRACE_MS";
/// Environment variable enabling [`ExecutorConfig::collect_stats`].
pub const STATS_ENV: &str = "PLAN_EXECUTOR_STATS";

/// Error raised for invalid executor configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// At least one worker is required.
    #[error("max worker count must be at least 1, got {0}")]
    InvalidMaxWorkers(usize),
    /// A configuration value could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Name of the offending setting.
        key: &'static str,
        /// Raw value as found.
        value: String,
    },
}

/// Settings of a [`crate::executor::PlanExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Upper bound on threads executing units at the same time, the calling
    /// thread of `process` included. Must be at least 1.
    pub max_workers: usize,
    /// How long `assert_healthy` keeps re-checking before it declares a
    /// deadlock.
    pub health_grace_period: Duration,
    /// Whether worker timing statistics are collected and reported on stop.
    pub collect_stats: bool,
    /// Prefix of background worker thread names.
    pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            health_grace_period: Duration::from_secs(2),
            collect_stats: false,
            thread_name_prefix: "execution-worker".to_owned(),
        }
    }
}

impl ExecutorConfig {
    /// Sets [`ExecutorConfig::max_workers`].
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets [`ExecutorConfig::health_grace_period`].
    #[must_use]
    pub fn with_health_grace_period(mut self, period: Duration) -> Self {
        self.health_grace_period = period;
        self
    }

    /// Sets [`ExecutorConfig::collect_stats`].
    #[must_use]
    pub fn with_stats(mut self, collect_stats: bool) -> Self {
        self.collect_stats = collect_stats;
        self
    }

    /// Sets [`ExecutorConfig::thread_name_prefix`].
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    /// If a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `PLAN_EXECUTOR_*` keys.
    ///
    /// # Errors
    /// If a value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(MAX_WORKERS_ENV) {
            config.max_workers = parse(MAX_WORKERS_ENV, value)?;
        }
        if let Some(value) = lookup(HEALTH_GRACE_MS_ENV) {
            config.health_grace_period = Duration::from_millis(parse(HEALTH_GRACE_MS_ENV, value)?);
        }
        if let Some(value) = lookup(STATS_ENV) {
            config.collect_stats = match value.trim() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => return Err(ConfigError::InvalidValue { key: STATS_ENV, value }),
            };
        }
        Ok(config)
    }

    /// Validated worker count.
    ///
    /// # Errors
    /// If `max_workers` is zero.
    pub fn worker_count(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.max_workers).ok_or(ConfigError::InvalidMaxWorkers(self.max_workers))
    }
}

fn parse<T: core::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = ExecutorConfig::from_lookup(lookup(&[
            (MAX_WORKERS_ENV, "3"),
            (HEALTH_GRACE_MS_ENV, "250"),
            (STATS_ENV, "true"),
        ]))
        .unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.health_grace_period, Duration::from_millis(250));
        assert!(config.collect_stats);
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let config = ExecutorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ExecutorConfig::default());
    }

    #[test]
    fn garbage_values_are_rejected() {
        let err = ExecutorConfig::from_lookup(lookup(&[(MAX_WORKERS_ENV, "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: MAX_WORKERS_ENV,
                value: "many".to_owned()
            }
        );
        assert!(ExecutorConfig::from_lookup(lookup(&[(STATS_ENV, "maybe")])).is_err());
    }

    #[test]
    fn zero_workers_is_a_configuration_error() {
        let config = ExecutorConfig::default().with_max_workers(0);
        assert_eq!(config.worker_count(), Err(ConfigError::InvalidMaxWorkers(0)));
        assert_eq!(config.with_max_workers(4).worker_count().unwrap().get(), 4);
    }
}
