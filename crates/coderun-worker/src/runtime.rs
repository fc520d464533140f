// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for coderun-worker.
//!
//! [`WorkerRuntime`] wires a broker, a sandbox executor and language
//! settings into a running [`RpcWorker`] inside an existing tokio
//! application. When the broker connection or the task consumer is lost the
//! runtime reconnects, redeclares the task queue and resumes consuming until
//! it is shut down.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coderun_protocol::AmqpBroker;
//! use coderun_worker::runtime::WorkerRuntime;
//! use coderun_worker::sandbox::DockerSandboxExecutor;
//! use coderun_worker::settings::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(AmqpBroker::connect("amqp://localhost:5672").await?);
//!
//!     let runtime = WorkerRuntime::builder()
//!         .broker(broker)
//!         .sandbox(Arc::new(DockerSandboxExecutor::from_env()))
//!         .settings(Settings::from_file("settings.json")?)
//!         .max_concurrent_tasks(8)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coderun_protocol::{Broker, RunCodeTask};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::executor::Executor;
use crate::sandbox::SandboxExecutor;
use crate::settings::Settings;
use crate::worker::{FailurePolicy, RpcWorker, RpcWorkerConfig, WorkerStats, WorkerStatsSnapshot};

/// Builder for creating a [`WorkerRuntime`].
#[derive(Default)]
pub struct WorkerRuntimeBuilder {
    broker: Option<Arc<dyn Broker>>,
    sandbox: Option<Arc<dyn SandboxExecutor>>,
    settings: Option<Settings>,
    worker: RpcWorkerConfig,
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker (required).
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the sandbox executor (required).
    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxExecutor>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Set the language settings (required).
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the task queue name.
    ///
    /// Default: `code_run`
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.worker.queue_name = name.into();
        self
    }

    /// Set the exchange the task queue is bound to. Empty disables the binding.
    ///
    /// Default: `code_run`
    pub fn exchange_name(mut self, name: impl Into<String>) -> Self {
        self.worker.exchange_name = name.into();
        self
    }

    /// Set the maximum number of tasks executing at once.
    ///
    /// Default: 0 (unlimited)
    pub fn max_concurrent_tasks(mut self, max: usize) -> Self {
        self.worker.max_concurrent_tasks = max;
        self
    }

    /// Set the failure policy.
    ///
    /// Default: [`FailurePolicy::ReplyWithFailure`]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.worker.failure_policy = policy;
        self
    }

    /// Set the first delay between reconnect attempts. Doubles on every
    /// failed attempt up to 30 seconds.
    ///
    /// Default: 500ms
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.worker.reconnect_backoff = backoff;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker is required"))?;
        let sandbox = self
            .sandbox
            .ok_or_else(|| anyhow::anyhow!("sandbox is required"))?;
        let settings = self
            .settings
            .ok_or_else(|| anyhow::anyhow!("settings are required"))?;

        Ok(WorkerRuntimeConfig {
            broker,
            executor: Executor::new(sandbox, Arc::new(settings)),
            worker: self.worker,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    broker: Arc<dyn Broker>,
    executor: Executor,
    worker: RpcWorkerConfig,
}

impl WorkerRuntimeConfig {
    /// Declare the task queue and spawn the receive loop.
    pub async fn start(self) -> Result<WorkerRuntime> {
        let worker = RpcWorker::declare(self.broker, self.worker).await?;
        let shutdown = worker.shutdown_handle();
        let stats = worker.stats_handle();
        let queue = worker.queue().to_string();

        let executor = self.executor;
        let handle = tokio::spawn(async move {
            let handler = move |task: RunCodeTask| {
                let executor = executor.clone();
                async move { executor.execute(&task).await }
            };
            loop {
                match worker.consume(handler.clone()).await {
                    Err(e @ (WorkerError::Broker(_) | WorkerError::ConsumerClosed)) => {
                        warn!(error = %e, "Task consumer lost, reconnecting");
                        if !worker.reconnect().await {
                            return Ok(());
                        }
                    }
                    outcome => return outcome,
                }
            }
        });

        info!(queue = %queue, "WorkerRuntime started");

        Ok(WorkerRuntime {
            handle,
            shutdown,
            stats,
            queue,
        })
    }
}

/// A running worker that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkerRuntime {
    handle: JoinHandle<Result<(), WorkerError>>,
    shutdown: Arc<Notify>,
    stats: Arc<WorkerStats>,
    queue: String,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// Name of the consumed task queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current worker counters.
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the receive loop has stopped on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop pulling tasks, wait for in-flight tasks to reply, and return.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");
        self.shutdown.notify_one();
        self.handle.await??;
        info!("WorkerRuntime shut down");
        Ok(())
    }

    /// Run until `signal` resolves, then shut down gracefully.
    ///
    /// Returns early with the loop's error if it stops on its own. Broker
    /// outages do not stop it; the runtime keeps reconnecting.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut handle = self.handle;
        let stopped = tokio::select! {
            _ = signal => None,
            joined = &mut handle => Some(joined),
        };
        let joined = match stopped {
            Some(joined) => joined,
            None => {
                info!("Shutdown signal received");
                self.shutdown.notify_one();
                handle.await
            }
        };
        joined??;
        info!("WorkerRuntime shut down");
        Ok(())
    }
}
