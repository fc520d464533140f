// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! coderun worker - standalone process
//!
//! Connects to the AMQP broker, consumes run requests and executes them in
//! docker sandboxes until interrupted.

use std::sync::Arc;

use tracing::{info, warn};

use coderun_protocol::AmqpBroker;
use coderun_worker::config::WorkerConfig;
use coderun_worker::runtime::WorkerRuntime;
use coderun_worker::sandbox::{DockerSandboxExecutor, SandboxExecutor};
use coderun_worker::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coderun_worker=info,coderun_protocol=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = WorkerConfig::from_env()?;
    let settings = Settings::from_file(&config.settings_path)?;

    info!(
        task_queue = %config.task_queue,
        task_exchange = %config.task_exchange,
        settings = %config.settings_path.display(),
        languages = settings.languages.len(),
        max_concurrent_tasks = config.max_concurrent_tasks,
        failure_policy = %config.failure_policy,
        "Starting coderun worker"
    );

    let broker = AmqpBroker::connect_with_retry(
        &config.amqp_url,
        config.connect_attempts,
        config.connect_backoff,
    )
    .await?;
    broker.set_prefetch(config.prefetch).await?;
    let broker = Arc::new(broker);

    let sandbox = Arc::new(DockerSandboxExecutor::from_env());
    info!(executor_type = sandbox.executor_type(), "Sandbox executor initialized");

    let runtime = WorkerRuntime::builder()
        .broker(broker.clone())
        .sandbox(sandbox)
        .settings(settings)
        .queue_name(&config.task_queue)
        .exchange_name(&config.task_exchange)
        .max_concurrent_tasks(config.max_concurrent_tasks)
        .failure_policy(config.failure_policy)
        .reconnect_backoff(config.connect_backoff)
        .build()?
        .start()
        .await?;

    info!(queue = %runtime.queue(), "Worker ready");

    let result = runtime
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    info!("Coderun worker shut down");

    result
}
