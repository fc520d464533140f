// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution orchestrator.
//!
//! Turns a [`RunCodeTask`] into a [`RunResult`]: resolve the language
//! version, build a sandbox with the source file in place, drive it to
//! completion and translate its final state. The sandbox is disposed on
//! every path.

use std::sync::Arc;

use coderun_protocol::{RunCodeTask, RunResult};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::sandbox::{Sandbox, SandboxError, SandboxExecutor, SandboxSpec};
use crate::settings::Settings;

/// Errors that prevent a task from producing a result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Language is not configured.
    #[error("Unknown language: {0}")]
    UnknownLanguage(String),

    /// Language is configured but the version is not.
    #[error("Unknown version {version} for language {language}")]
    UnknownVersion {
        /// Requested language.
        language: String,
        /// Requested version.
        version: String,
    },

    /// The sandbox failed while being built or driven.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Executes tasks in sandboxes built from [`Settings`].
#[derive(Clone)]
pub struct Executor {
    sandbox: Arc<dyn SandboxExecutor>,
    settings: Arc<Settings>,
}

impl Executor {
    /// Create an executor.
    pub fn new(sandbox: Arc<dyn SandboxExecutor>, settings: Arc<Settings>) -> Self {
        Self { sandbox, settings }
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The sandbox spec a task would run with.
    pub fn spec_for(&self, task: &RunCodeTask) -> Result<SandboxSpec, ExecutionError> {
        let build = self
            .settings
            .resolve(&task.language, &task.language_version)?;
        let file = build.source_file(&task.code);
        Ok(SandboxSpec {
            profile: build.profile,
            limits: build.limits,
            files: vec![file],
        })
    }

    /// Run one task to completion.
    #[instrument(skip(self, task), fields(language = %task.language, version = %task.language_version))]
    pub async fn execute(&self, task: &RunCodeTask) -> Result<RunResult, ExecutionError> {
        let spec = self.spec_for(task)?;
        let mut sandbox = self.sandbox.build(spec).await?;
        let name = sandbox.name().to_string();
        info!(sandbox = %name, "Created sandbox");

        let outcome = drive(sandbox.as_mut(), task).await;

        if let Err(e) = sandbox.dispose().await {
            warn!(sandbox = %name, error = %e, "Failed to dispose sandbox");
        }

        match &outcome {
            Ok(result) => info!(
                sandbox = %name,
                ok = result.ok,
                execution_time = result.execution_time,
                time_limit = result.time_limit,
                memory_limit = result.memory_limit,
                "Sandbox finished"
            ),
            Err(e) => warn!(sandbox = %name, error = %e, "Sandbox failed"),
        }
        outcome
    }
}

async fn drive(sandbox: &mut dyn Sandbox, task: &RunCodeTask) -> Result<RunResult, ExecutionError> {
    sandbox.run(task.stdin.as_bytes()).await?;
    sandbox.wait().await?;
    let logs = sandbox.logs(true, true).await?;
    let state = sandbox.state().await?;

    let ok = state.succeeded();
    Ok(RunResult {
        ok,
        execution_time: state.duration.as_secs_f64(),
        logs,
        time_limit: state.time_limit_exceeded,
        memory_limit: state.memory_limit_exceeded,
        runtime_error: !ok,
        error: None,
    })
}
