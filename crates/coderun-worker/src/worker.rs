// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC worker.
//!
//! Consumes run requests from the shared task queue, hands each one to a
//! handler in its own task, and publishes the result to the caller's reply
//! queue under the caller's correlation id.
//!
//! Per delivery:
//! - body decodes and carries `correlation_id` + `reply_to` → ack, dispatch
//! - anything else → reject without requeue, handler never invoked
//!
//! Acknowledgement happens before execution, so a crash mid-execution loses
//! the request rather than running it twice.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use coderun_protocol::{
    Broker, DEFAULT_EXCHANGE, Delivery, DeliveryStream, Envelope, ExchangeKind, QueueOptions,
    RunCodeTask, RunResult,
};
use futures::{FutureExt, StreamExt};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::error::{Result, WorkerError};

/// What to do when the handler fails to produce a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Publish a synthesized `runtime_error` result carrying the error text.
    #[default]
    ReplyWithFailure,
    /// Log and send nothing; the caller only learns through its own timeout.
    Silent,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reply" | "reply_with_failure" => Ok(FailurePolicy::ReplyWithFailure),
            "silent" => Ok(FailurePolicy::Silent),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::ReplyWithFailure => write!(f, "reply"),
            FailurePolicy::Silent => write!(f, "silent"),
        }
    }
}

/// Configuration for the RPC worker.
#[derive(Debug, Clone)]
pub struct RpcWorkerConfig {
    /// Shared task queue.
    pub queue_name: String,
    /// Exchange the queue is bound to. Empty means the default exchange only.
    pub exchange_name: String,
    /// Maximum tasks executing at once (0 = unlimited).
    pub max_concurrent_tasks: usize,
    /// Behaviour on handler failure.
    pub failure_policy: FailurePolicy,
    /// First delay between reconnect attempts; doubles up to
    /// [`MAX_RECONNECT_BACKOFF`].
    pub reconnect_backoff: Duration,
}

/// Upper bound for the delay between reconnect attempts.
pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

impl Default for RpcWorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "code_run".to_string(),
            exchange_name: "code_run".to_string(),
            max_concurrent_tasks: 0,
            failure_policy: FailurePolicy::default(),
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

/// Live counters of a worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    received: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    replied: AtomicU64,
    in_flight: AtomicUsize,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Deliveries taken off the queue.
    pub received: u64,
    /// Deliveries rejected as malformed.
    pub rejected: u64,
    /// Tasks handed to the handler.
    pub dispatched: u64,
    /// Handler calls that produced a result.
    pub completed: u64,
    /// Handler calls that failed or panicked.
    pub failed: u64,
    /// Results published.
    pub replied: u64,
    /// Dispatched tasks not finished yet.
    pub in_flight: usize,
}

impl WorkerStats {
    /// Read every counter.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            received: self.received.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            dispatched: self.dispatched.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            replied: self.replied.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the in-flight gauge when a dispatch unit ends, however it ends.
struct InFlightGuard(Arc<WorkerStats>);

impl InFlightGuard {
    fn enter(stats: Arc<WorkerStats>) -> Self {
        stats.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Consumer of the shared task queue.
pub struct RpcWorker {
    broker: Arc<dyn Broker>,
    config: RpcWorkerConfig,
    queue: String,
    stats: Arc<WorkerStats>,
    shutdown: Arc<Notify>,
}

impl RpcWorker {
    /// Declare the durable task queue (bound to the configured exchange) and
    /// create a worker for it.
    #[instrument(skip(broker, config), fields(queue = %config.queue_name))]
    pub async fn declare(broker: Arc<dyn Broker>, config: RpcWorkerConfig) -> Result<Self> {
        let queue = declare_topology(broker.as_ref(), &config).await?;
        Ok(Self {
            broker,
            config,
            queue,
            stats: Arc::new(WorkerStats::default()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Re-establish the broker connection and redeclare the task queue,
    /// retrying with exponential backoff.
    ///
    /// Returns `false` if shutdown was requested before the worker got back.
    pub async fn reconnect(&self) -> bool {
        let mut delay = self.config.reconnect_backoff;
        let mut attempt: u32 = 1;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Shutdown requested while reconnecting");
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = match self.broker.reconnect().await {
                Ok(()) => declare_topology(self.broker.as_ref(), &self.config).await,
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(_) => {
                    info!(attempt, queue = %self.queue, "Reconnected to broker");
                    return true;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconnect failed, retrying"
                    );
                    delay = (delay * 2).min(MAX_RECONNECT_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }

    /// Name of the consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Shared counters, readable while the worker runs.
    pub fn stats_handle(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Current counters.
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the receive loop until shutdown or until the consumer stream ends.
    ///
    /// On shutdown the loop stops pulling messages and waits for every
    /// dispatched task to publish its result before returning `Ok(())`. A
    /// closed consumer stream drains the same way and returns
    /// [`WorkerError::ConsumerClosed`].
    pub async fn consume<H, Fut, E>(&self, handler: H) -> Result<()>
    where
        H: Fn(RunCodeTask) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = std::result::Result<RunResult, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let mut deliveries = self.broker.consume(&self.queue).await?;
        let semaphore = (self.config.max_concurrent_tasks > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_tasks)));
        let mut in_flight = JoinSet::new();

        info!(
            queue = %self.queue,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            failure_policy = %self.config.failure_policy,
            "RPC worker consuming"
        );

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("RPC worker shutting down");
                    break Ok(());
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(joined);
                }

                next = next_admitted(&mut deliveries, semaphore.as_ref()) => match next {
                    Some((Ok(delivery), permit)) => {
                        self.accept(delivery, permit, &handler, &mut in_flight).await;
                    }
                    Some((Err(e), _)) => {
                        error!(error = %e, "Task consumer failed");
                        break Err(WorkerError::Broker(e));
                    }
                    None => {
                        warn!(queue = %self.queue, "Task consumer closed");
                        break Err(WorkerError::ConsumerClosed);
                    }
                },
            }
        };

        drop(deliveries);
        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Draining in-flight tasks");
        }
        while let Some(joined) = in_flight.join_next().await {
            reap(joined);
        }
        info!(stats = ?self.stats.snapshot(), "RPC worker stopped");

        outcome
    }

    /// Validate one delivery and dispatch it.
    async fn accept<H, Fut, E>(
        &self,
        delivery: Delivery,
        permit: Option<OwnedSemaphorePermit>,
        handler: &H,
        in_flight: &mut JoinSet<()>,
    ) where
        H: Fn(RunCodeTask) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = std::result::Result<RunResult, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.stats.received.fetch_add(1, Ordering::SeqCst);

        let decoded = Envelope::<RunCodeTask>::from_delivery(&delivery).and_then(|envelope| {
            let correlation_id = envelope.require_correlation_id()?.to_string();
            let reply_to = envelope.require_reply_to()?.to_string();
            Ok((envelope.body, correlation_id, reply_to))
        });

        let (task, correlation_id, reply_to) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                warn!(
                    correlation_id = ?delivery.correlation_id(),
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Rejecting malformed task"
                );
                if let Err(e) = delivery.reject(false).await {
                    error!(error = %e, "Failed to reject task");
                }
                self.stats.rejected.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        // An unacked task comes back after a channel failure; running it now
        // would run it twice.
        if let Err(e) = delivery.ack().await {
            error!(correlation_id = %correlation_id, error = %e, "Failed to ack task, skipping");
            return;
        }

        debug!(
            correlation_id = %correlation_id,
            language = %task.language,
            version = %task.language_version,
            "Dispatching task"
        );
        self.stats.dispatched.fetch_add(1, Ordering::SeqCst);

        let guard = InFlightGuard::enter(self.stats.clone());
        let handler = handler.clone();
        let broker = self.broker.clone();
        let stats = self.stats.clone();
        let policy = self.config.failure_policy;
        let span = info_span!("dispatch", correlation_id = %correlation_id);

        in_flight.spawn(
            async move {
                let _permit = permit;
                let _guard = guard;

                let outcome = AssertUnwindSafe(handler(task)).catch_unwind().await;
                let result = match outcome {
                    Ok(Ok(result)) => {
                        stats.completed.fetch_add(1, Ordering::SeqCst);
                        Some(result)
                    }
                    Ok(Err(e)) => {
                        stats.failed.fetch_add(1, Ordering::SeqCst);
                        error!(error = %e, "Task execution failed");
                        failure_reply(policy, e.to_string())
                    }
                    Err(_) => {
                        stats.failed.fetch_add(1, Ordering::SeqCst);
                        error!("Task handler panicked");
                        failure_reply(policy, "task handler panicked".to_string())
                    }
                };

                let Some(result) = result else {
                    return;
                };
                match publish_result(broker.as_ref(), &reply_to, &correlation_id, result).await {
                    Ok(()) => {
                        stats.replied.fetch_add(1, Ordering::SeqCst);
                        debug!(reply_to = %reply_to, "Result published");
                    }
                    Err(e) => error!(reply_to = %reply_to, error = %e, "Failed to publish result"),
                }
            }
            .instrument(span),
        );
    }
}

/// Declare the durable task queue and, if configured, its exchange and binding.
async fn declare_topology(broker: &dyn Broker, config: &RpcWorkerConfig) -> Result<String> {
    let queue = broker
        .declare_queue(&config.queue_name, QueueOptions::durable())
        .await?;

    if !config.exchange_name.is_empty() {
        broker
            .declare_exchange(&config.exchange_name, ExchangeKind::Direct)
            .await?;
        broker
            .bind_queue(&queue, &config.exchange_name, &queue)
            .await?;
    }

    info!(
        queue = %queue,
        exchange = %config.exchange_name,
        broker = broker.broker_type(),
        "Task queue declared"
    );
    Ok(queue)
}

/// Acquire admission (if bounded), then pull the next delivery.
async fn next_admitted(
    deliveries: &mut DeliveryStream,
    semaphore: Option<&Arc<Semaphore>>,
) -> Option<(coderun_protocol::broker::Result<Delivery>, Option<OwnedSemaphorePermit>)> {
    let permit = match semaphore {
        Some(semaphore) => Some(semaphore.clone().acquire_owned().await.ok()?),
        None => None,
    };
    let next = deliveries.next().await?;
    Some((next, permit))
}

fn failure_reply(policy: FailurePolicy, error: String) -> Option<RunResult> {
    match policy {
        FailurePolicy::ReplyWithFailure => Some(RunResult::failure(error)),
        FailurePolicy::Silent => None,
    }
}

/// Publish a result to the caller's reply queue via the default exchange.
pub async fn publish_result(
    broker: &dyn Broker,
    reply_to: &str,
    correlation_id: &str,
    result: RunResult,
) -> Result<()> {
    let message = Envelope::new(result)
        .with_correlation_id(correlation_id)
        .with_reply_to(reply_to)
        .to_message()?;
    broker.publish(DEFAULT_EXCHANGE, reply_to, message).await?;
    Ok(())
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Dispatch task panicked");
        } else {
            debug!(error = %e, "Dispatch task cancelled");
        }
    }
}
