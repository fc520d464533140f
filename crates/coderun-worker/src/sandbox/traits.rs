// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox trait definitions.
//!
//! Defines the abstract interface for isolated execution environments.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from sandbox operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// Container image is not available and could not be pulled.
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Sandbox could not be created or started.
    #[error("Sandbox start failed: {0}")]
    StartFailed(String),

    /// Operation requires a started sandbox.
    #[error("Sandbox not started")]
    NotStarted,

    /// `run` was called twice.
    #[error("Sandbox already started")]
    AlreadyStarted,

    /// A file name would escape the sandbox working directory.
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    /// A container engine command exited with non-zero status.
    #[error("{command} failed with exit code {exit_code:?}: {stderr}")]
    Command {
        /// Engine subcommand that failed.
        command: String,
        /// Exit status of the engine CLI.
        exit_code: Option<i32>,
        /// Standard error of the engine CLI.
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Resource limits applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Wall-clock budget in seconds.
    pub time_secs: f64,
    /// Memory ceiling in megabytes (swap included).
    pub memory_mb: u64,
    /// CPU share, in cores.
    pub cpu_count: f64,
    /// Maximum number of processes.
    pub pids_limit: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_secs: 5.0,
            memory_mb: 128,
            cpu_count: 1.0,
            pids_limit: 64,
        }
    }
}

impl Limits {
    /// Wall-clock budget as a duration. Values [`checked_time_limit`](Self::checked_time_limit)
    /// refuses clamp to zero.
    pub fn time_limit(&self) -> Duration {
        self.checked_time_limit().unwrap_or(Duration::ZERO)
    }

    /// Wall-clock budget, if `time_secs` is positive and fits in a [`Duration`].
    pub fn checked_time_limit(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.time_secs)
            .ok()
            .filter(|limit| !limit.is_zero())
    }
}

/// Image and entrypoint of a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct DockerProfile {
    /// Container image reference.
    pub image: String,
    /// Rendered argv run inside the container.
    pub command: Vec<String>,
    /// Directory the source files are mounted at.
    pub workdir: PathBuf,
    /// User the program runs as.
    pub user: Option<String>,
}

/// A file placed in the sandbox working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    /// Bare file name, no directories.
    pub name: String,
    /// File contents.
    pub content: String,
}

impl SandboxFile {
    /// Create a file entry.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Reject names that are empty or contain path components.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(SandboxError::InvalidFileName(self.name.clone()));
        }
        Ok(())
    }
}

/// Everything needed to build a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    /// Image, command, working directory and user.
    pub profile: DockerProfile,
    /// Resource limits.
    pub limits: Limits,
    /// Source files written into the working directory.
    pub files: Vec<SandboxFile>,
}

/// Exit state of a finished sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxState {
    /// Program exit code. `None` when the program was killed without one.
    pub exit_code: Option<i32>,
    /// Wall-clock time between start and exit.
    pub duration: Duration,
    /// The wall-clock budget ran out and the program was killed.
    pub time_limit_exceeded: bool,
    /// The program was killed for exceeding its memory ceiling.
    pub memory_limit_exceeded: bool,
}

impl SandboxState {
    /// The program exited with status zero.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Which stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Factory for sandboxes.
///
/// Executors are shared across concurrently running tasks; each call to
/// [`build`](Self::build) produces an independent sandbox.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Executor type identifier (e.g., "docker", "mock")
    fn executor_type(&self) -> &'static str;

    /// Create a sandbox with the given files in place. The program is not started.
    async fn build(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>>;
}

/// A single isolated execution environment.
///
/// Lifecycle: `run` → `wait` → `logs`/`state` → `dispose`. Callers must
/// dispose every sandbox they build, on success and failure alike.
#[async_trait]
pub trait Sandbox: Send {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Start the program and feed `stdin` to it.
    async fn run(&mut self, stdin: &[u8]) -> Result<()>;

    /// Wait until the program exits or its time limit expires.
    async fn wait(&mut self) -> Result<()>;

    /// Output lines in the order they were produced.
    async fn logs(&mut self, stdout: bool, stderr: bool) -> Result<Vec<String>>;

    /// Exit state after `wait` returned.
    async fn state(&mut self) -> Result<SandboxState>;

    /// Release every resource held by the sandbox.
    async fn dispose(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_validation() {
        assert!(SandboxFile::new("main.py", "").validate().is_ok());
        assert!(SandboxFile::new("Main.java", "").validate().is_ok());

        for bad in ["", ".", "..", "../x.py", "a/b.py", "a\\b.py"] {
            assert!(
                matches!(
                    SandboxFile::new(bad, "").validate(),
                    Err(SandboxError::InvalidFileName(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_time_limit_clamps_invalid_values() {
        let limits = Limits {
            time_secs: 1.5,
            ..Default::default()
        };
        assert_eq!(limits.time_limit(), Duration::from_millis(1500));

        let negative = Limits {
            time_secs: -1.0,
            ..Default::default()
        };
        assert_eq!(negative.time_limit(), Duration::ZERO);
        assert!(negative.checked_time_limit().is_none());

        let huge = Limits {
            time_secs: 1e20,
            ..Default::default()
        };
        assert!(huge.checked_time_limit().is_none());
    }

    #[test]
    fn test_state_success_follows_exit_code() {
        let state = SandboxState {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(state.succeeded());

        let failed = SandboxState {
            exit_code: Some(1),
            time_limit_exceeded: true,
            ..Default::default()
        };
        assert!(!failed.succeeded());

        let killed = SandboxState {
            exit_code: None,
            ..Default::default()
        };
        assert!(!killed.succeeded());
    }
}
