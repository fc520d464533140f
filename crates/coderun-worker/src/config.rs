// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for coderun-worker.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::worker::FailurePolicy;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// AMQP broker URL
    pub amqp_url: String,
    /// Shared task queue name
    pub task_queue: String,
    /// Exchange the task queue is bound to
    pub task_exchange: String,
    /// Path of the language settings document
    pub settings_path: PathBuf,
    /// Maximum tasks executing at once (0 = unlimited)
    pub max_concurrent_tasks: usize,
    /// What to do when a task cannot be executed
    pub failure_policy: FailurePolicy,
    /// Unacknowledged deliveries per consumer (0 = broker default)
    pub prefetch: u16,
    /// Connection attempts at startup
    pub connect_attempts: u32,
    /// Base delay between connection attempts
    pub connect_backoff: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let amqp_url = lookup("CODERUN_AMQP_URL")
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingEnvVar("CODERUN_AMQP_URL"))?;

        let task_queue = lookup("CODERUN_TASK_QUEUE").unwrap_or_else(|| "code_run".to_string());
        let task_exchange =
            lookup("CODERUN_TASK_EXCHANGE").unwrap_or_else(|| "code_run".to_string());

        let settings_path = PathBuf::from(
            lookup("CODERUN_SETTINGS_PATH").unwrap_or_else(|| "./settings.json".to_string()),
        );

        let max_concurrent_tasks = parse_var(&lookup, "CODERUN_MAX_CONCURRENT_TASKS", 0)?;

        let failure_policy = match lookup("CODERUN_FAILURE_POLICY") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                var: "CODERUN_FAILURE_POLICY",
                value,
            })?,
            None => FailurePolicy::default(),
        };

        let prefetch = parse_var(&lookup, "CODERUN_PREFETCH", 0)?;
        let connect_attempts = parse_var(&lookup, "CODERUN_CONNECT_ATTEMPTS", 10)?;
        let connect_backoff =
            Duration::from_millis(parse_var(&lookup, "CODERUN_CONNECT_BACKOFF_MS", 500)?);

        Ok(Self {
            amqp_url,
            task_queue,
            task_exchange,
            settings_path,
            max_concurrent_tasks,
            failure_policy,
            prefetch,
            connect_attempts,
            connect_backoff,
        })
    }
}

/// Parse `var` if set, otherwise use `default`.
fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// An environment variable has an unusable value.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// The settings file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Settings file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid JSON for the expected shape.
    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The settings parse but cannot be used.
    #[error("Invalid settings: {0}")]
    Invalid(String),
}
