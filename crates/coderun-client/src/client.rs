// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC client: publishes tasks and routes replies back to their callers.
//!
//! Every request gets a fresh correlation id and a slot in the pending table.
//! A single background task consumes the private reply queue and resolves
//! the slot whose id matches the reply; replies nobody waits for are
//! rejected without requeue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use coderun_protocol::{
    Broker, DEFAULT_EXCHANGE, Delivery, DeliveryStream, Envelope, ExchangeKind, QueueOptions,
    RunCodeTask, RunResult,
};
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

type Waiter = oneshot::Sender<Result<RunResult>>;

#[derive(Default)]
struct Waiters {
    shut: bool,
    by_id: HashMap<String, Waiter>,
}

/// Correlation id → waiting caller.
#[derive(Default)]
struct PendingTable {
    waiters: Mutex<Waiters>,
    /// Set by `close` so the reply loop leaves waiters alone when it ends.
    closing: AtomicBool,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter, unless the reply loop is gone.
    fn insert(&self, correlation_id: String, waiter: Waiter) -> Result<()> {
        let mut waiters = self.lock();
        if waiters.shut {
            return Err(ClientError::Closed);
        }
        waiters.by_id.insert(correlation_id, waiter);
        Ok(())
    }

    fn remove(&self, correlation_id: &str) -> Option<Waiter> {
        self.lock().by_id.remove(correlation_id)
    }

    fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    fn is_shut(&self) -> bool {
        self.lock().shut
    }

    /// Refuse new waiters. Unless the client is closing, hand back every
    /// registered waiter so it can be failed.
    fn shut(&self) -> Vec<Waiter> {
        let mut waiters = self.lock();
        waiters.shut = true;
        if self.closing.load(Ordering::Acquire) {
            return Vec::new();
        }
        waiters.by_id.drain().map(|(_, waiter)| waiter).collect()
    }
}

/// A submitted request waiting for its result.
///
/// Resolves once the matching reply arrives. Dropping it before then
/// forgets the request; a late reply is rejected like any unknown one.
#[must_use = "a request is only observed by awaiting its PendingResult"]
pub struct PendingResult {
    correlation_id: String,
    rx: oneshot::Receiver<Result<RunResult>>,
    table: Weak<PendingTable>,
}

impl PendingResult {
    /// Correlation id the request was published with.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingResult {
    type Output = Result<RunResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped with the table: the client is gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.correlation_id);
        }
    }
}

/// Client for submitting code to workers over a broker.
///
/// Cheap to share behind an `Arc`: any number of requests may be in flight
/// at once, each resolved independently.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    task_queue: String,
    exchange: String,
    reply_queue: String,
    pending: Arc<PendingTable>,
    reply_loop: JoinHandle<()>,
    default_timeout: Option<Duration>,
}

impl RpcClient {
    /// Declare the task queue (and exchange, if configured), create a
    /// private reply queue and start routing replies.
    #[instrument(skip(broker, config), fields(broker = broker.broker_type(), task_queue = %config.task_queue))]
    pub async fn connect(broker: Arc<dyn Broker>, config: &ClientConfig) -> Result<Self> {
        broker
            .declare_queue(&config.task_queue, QueueOptions::durable())
            .await?;

        let exchange = match config.task_exchange.as_deref() {
            Some(exchange) if !exchange.is_empty() => {
                broker
                    .declare_exchange(exchange, ExchangeKind::Direct)
                    .await?;
                broker
                    .bind_queue(&config.task_queue, exchange, &config.task_queue)
                    .await?;
                exchange.to_string()
            }
            _ => DEFAULT_EXCHANGE.to_string(),
        };

        let reply_queue = broker.declare_queue("", QueueOptions::private()).await?;
        let replies = broker.consume(&reply_queue).await?;

        let pending = Arc::new(PendingTable::default());
        let reply_loop = tokio::spawn(route_replies(replies, pending.clone()));

        info!(reply_queue = %reply_queue, exchange = %exchange, "RPC client ready");

        Ok(Self {
            broker,
            task_queue: config.task_queue.clone(),
            exchange,
            reply_queue,
            pending,
            reply_loop,
            default_timeout: config.default_timeout,
        })
    }

    /// Name of the private reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Whether replies are still being routed. Once false, `submit` fails
    /// with [`ClientError::Closed`].
    pub fn is_open(&self) -> bool {
        !self.pending.is_shut()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run `code` and wait for its result.
    ///
    /// Applies the configured default timeout, if any.
    pub async fn run(
        &self,
        code: impl Into<String>,
        language: impl Into<String>,
        version: impl Into<String>,
        stdin: impl Into<String>,
    ) -> Result<RunResult> {
        let task = RunCodeTask::new(code, language, version).with_stdin(stdin);
        match self.default_timeout {
            Some(timeout) => self.request_with_timeout(task, timeout).await,
            None => self.request(task).await,
        }
    }

    /// Publish a task and wait for its result without a deadline.
    pub async fn request(&self, task: RunCodeTask) -> Result<RunResult> {
        self.submit(task).await?.await
    }

    /// Publish a task and wait at most `timeout` for its result.
    ///
    /// On timeout the request is forgotten; a late reply is rejected.
    pub async fn request_with_timeout(
        &self,
        task: RunCodeTask,
        timeout: Duration,
    ) -> Result<RunResult> {
        let pending = self.submit(task).await?;
        let correlation_id = pending.correlation_id().to_string();
        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                warn!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Publish a task and return a handle to its eventual result.
    ///
    /// The waiter is registered before publishing so a fast reply cannot
    /// miss it.
    #[instrument(skip(self, task), fields(language = %task.language, version = %task.language_version))]
    pub async fn submit(&self, task: RunCodeTask) -> Result<PendingResult> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx)?;

        // Dropping this on any error below prunes the table entry.
        let pending = PendingResult {
            correlation_id: correlation_id.clone(),
            rx,
            table: Arc::downgrade(&self.pending),
        };

        let message = Envelope::new(task)
            .with_correlation_id(&correlation_id)
            .with_reply_to(&self.reply_queue)
            .to_message()?;
        self.broker
            .publish(&self.exchange, &self.task_queue, message)
            .await?;

        debug!(correlation_id = %correlation_id, "Published task");
        Ok(pending)
    }

    /// Delete the reply queue. Requests still waiting are left unresolved
    /// until they time out or the client is dropped; new submits fail.
    pub async fn close(&self) -> Result<()> {
        self.pending.closing.store(true, Ordering::Release);
        if let Err(e) = self.broker.delete_queue(&self.reply_queue).await {
            self.pending.closing.store(false, Ordering::Release);
            return Err(e.into());
        }
        info!(reply_queue = %self.reply_queue, pending = self.pending_count(), "RPC client closed");
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reply_loop.abort();
    }
}

async fn route_replies(mut replies: DeliveryStream, pending: Arc<PendingTable>) {
    while let Some(next) = replies.next().await {
        match next {
            Ok(delivery) => route_reply(delivery, &pending).await,
            Err(e) => {
                error!(error = %e, "Reply consumer failed");
                break;
            }
        }
    }

    let orphaned = pending.shut();
    if orphaned.is_empty() {
        debug!("Reply consumer ended");
        return;
    }
    warn!(pending = orphaned.len(), "Reply consumer lost, failing pending requests");
    for waiter in orphaned {
        let _ = waiter.send(Err(ClientError::Closed));
    }
}

async fn route_reply(delivery: Delivery, pending: &PendingTable) {
    let waiter = delivery
        .correlation_id()
        .and_then(|correlation_id| pending.remove(correlation_id));

    let Some(waiter) = waiter else {
        warn!(
            correlation_id = delivery.correlation_id().unwrap_or("<none>"),
            "Rejecting reply nobody is waiting for"
        );
        if let Err(e) = delivery.reject(false).await {
            warn!(error = %e, "Failed to reject reply");
        }
        return;
    };

    // Matched replies are acked whether or not they decode.
    let outcome = Envelope::<RunResult>::from_delivery(&delivery)
        .map(|envelope| envelope.body)
        .map_err(|e| {
            warn!(
                correlation_id = delivery.correlation_id().unwrap_or_default(),
                error = %e,
                "Undecodable reply"
            );
            ClientError::Codec(e)
        });
    if let Err(e) = delivery.ack().await {
        warn!(error = %e, "Failed to ack reply");
    }

    // The caller may have given up in the meantime.
    let _ = waiter.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_result_prunes_on_drop() {
        let table = Arc::new(PendingTable::default());
        let (tx, rx) = oneshot::channel();
        table.insert("abc".to_string(), tx).unwrap();

        let pending = PendingResult {
            correlation_id: "abc".to_string(),
            rx,
            table: Arc::downgrade(&table),
        };
        assert_eq!(table.len(), 1);
        drop(pending);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_pending_result_closed_when_table_dropped() {
        let table = Arc::new(PendingTable::default());
        let (tx, rx) = oneshot::channel();
        table.insert("abc".to_string(), tx).unwrap();

        let pending = PendingResult {
            correlation_id: "abc".to_string(),
            rx,
            table: Arc::downgrade(&table),
        };
        drop(table);
        assert!(matches!(pending.await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_pending_result_resolves() {
        let table = Arc::new(PendingTable::default());
        let (tx, rx) = oneshot::channel();
        table.insert("abc".to_string(), tx).unwrap();

        let pending = PendingResult {
            correlation_id: "abc".to_string(),
            rx,
            table: Arc::downgrade(&table),
        };
        let waiter = table.remove("abc").unwrap();
        waiter.send(Ok(RunResult::failure("boom"))).unwrap();

        let result = pending.await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_shut_table_refuses_and_drains() {
        let table = PendingTable::default();
        let (tx, rx) = oneshot::channel();
        table.insert("abc".to_string(), tx).unwrap();

        let orphaned = table.shut();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(table.len(), 0);
        drop(orphaned);
        assert!(rx.await.is_err());

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            table.insert("def".to_string(), tx),
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shut_while_closing_keeps_waiters() {
        let table = PendingTable::default();
        let (tx, _rx) = oneshot::channel();
        table.insert("abc".to_string(), tx).unwrap();

        table.closing.store(true, Ordering::Release);
        assert!(table.shut().is_empty());
        assert_eq!(table.len(), 1);
        assert!(table.is_shut());
    }
}
