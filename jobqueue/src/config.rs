//! Queue configuration, optionally loaded from the environment.
//!
//! | Variable            | Default     |
//! |---------------------|-------------|
//! | `QUEUE_NAME`        | `"default"` |
//! | `QUEUE_WORKERS`     | `5`         |
//! | `QUEUE_BUFFER_SIZE` | `1000`      |
//! | `QUEUE_ENABLED`     | `true`      |
//! | `QUEUE_MAX_RETRY`   | `3`         |
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Used to tell queues apart in logs.
    pub name: String,
    /// Number of concurrent workers started by [`crate::Queue::start`].
    pub workers: usize,
    /// Number of jobs that can wait in the queue before pushes are rejected.
    pub buffer_size: usize,
    /// Whether the embedding application should start the queue at all.
    pub enabled: bool,
    /// Retry ceiling used by the convenience push functions.
    pub max_retry: u32,
}

impl QueueConfig {
    pub const DEFAULT_NAME: &'static str = "default";
    pub const DEFAULT_WORKERS: usize = 5;
    pub const DEFAULT_BUFFER_SIZE: usize = 1000;
    pub const DEFAULT_MAX_RETRY: u32 = 3;

    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration using `lookup` to resolve variables, unset ones use the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            name: lookup("QUEUE_NAME").unwrap_or(defaults.name),
            workers: parse(&lookup, "QUEUE_WORKERS")?.unwrap_or(defaults.workers),
            buffer_size: parse(&lookup, "QUEUE_BUFFER_SIZE")?.unwrap_or(defaults.buffer_size),
            enabled: parse(&lookup, "QUEUE_ENABLED")?.unwrap_or(defaults.enabled),
            max_retry: parse(&lookup, "QUEUE_MAX_RETRY")?.unwrap_or(defaults.max_retry),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Zero("buffer_size"));
        }
        Ok(())
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn with_workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    pub fn with_buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..self
        }
    }

    pub fn with_max_retry(self, max_retry: u32) -> Self {
        Self { max_retry, ..self }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_owned(),
            workers: Self::DEFAULT_WORKERS,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            enabled: true,
            max_retry: Self::DEFAULT_MAX_RETRY,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_use_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.workers, 5);
        assert_eq!(config.buffer_size, 1000);
    }

    #[test]
    fn variables_override_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("QUEUE_NAME", "mailer"),
            ("QUEUE_WORKERS", "2"),
            ("QUEUE_BUFFER_SIZE", " 10 "),
            ("QUEUE_ENABLED", "false"),
            ("QUEUE_MAX_RETRY", "7"),
        ]))
        .unwrap();

        assert_eq!(
            config,
            QueueConfig::default()
                .with_name("mailer")
                .with_workers(2)
                .with_buffer_size(10)
                .with_max_retry(7)
                .disabled()
        );
    }

    #[test]
    fn unparsable_values_are_rejected() {
        assert_matches!(
            QueueConfig::from_lookup(lookup(&[("QUEUE_WORKERS", "many")])),
            Err(ConfigError::Invalid { key: "QUEUE_WORKERS", .. })
        );
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert_eq!(
            QueueConfig::from_lookup(lookup(&[("QUEUE_BUFFER_SIZE", "0")])),
            Err(ConfigError::Zero("buffer_size"))
        );
        assert_eq!(
            QueueConfig::default().with_workers(0).validate(),
            Err(ConfigError::Zero("workers"))
        );
    }

    #[test]
    fn deserializes_partial_config() {
        let config: QueueConfig = serde_json::from_str(r#"{"workers": 8}"#).unwrap();

        assert_eq!(config, QueueConfig::default().with_workers(8));
    }

    impl QueueConfig {
        fn disabled(self) -> Self {
            Self {
                enabled: false,
                ..self
            }
        }
    }
}
