// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process broker.
//!
//! Mirrors the subset of AMQP semantics the RPC layer relies on, without a
//! network hop. Used by tests and by single-process deployments that embed
//! both the worker and its callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Acker, Broker, BrokerError, DEFAULT_EXCHANGE, Delivery, DeliveryStream, ExchangeKind,
    MessageProperties, OutgoingMessage, QueueOptions, Result,
};

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages routed into the queue (requeues excluded).
    pub published: u64,
    /// Messages waiting to be delivered.
    pub ready: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries rejected (requeued or not).
    pub rejected: u64,
    /// Rejected deliveries that were put back on the queue.
    pub requeued: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    routing_key: String,
    redelivered: bool,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>>;

struct QueueState {
    options: QueueOptions,
    tx: mpsc::UnboundedSender<StoredMessage>,
    rx: SharedReceiver,
    consumers: usize,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    stats: HashMap<String, QueueStats>,
    unroutable: u64,
    closed: bool,
}

impl Inner {
    fn enqueue(&mut self, queue: &str, message: StoredMessage) -> bool {
        let Some(state) = self.queues.get(queue) else {
            return false;
        };
        let requeue = message.redelivered;
        if state.tx.send(message).is_err() {
            return false;
        }
        let stats = self.stats.entry(queue.to_string()).or_default();
        stats.ready += 1;
        if !requeue {
            stats.published += 1;
        }
        true
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
        if let Some(stats) = self.stats.get_mut(name) {
            stats.ready = 0;
        }
    }
}

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking test thread; the map itself is intact.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Counters for a queue (zeroed if it never existed).
    pub fn queue_stats(&self, queue: &str) -> QueueStats {
        self.lock().stats.get(queue).copied().unwrap_or_default()
    }

    /// Whether a queue currently exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Number of active consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.consumers).unwrap_or(0)
    }

    /// Messages dropped because no queue matched.
    pub fn unroutable_count(&self) -> u64 {
        self.lock().unroutable
    }

    /// Drop every queue, ending all consumer streams, and refuse further
    /// operations. Simulates losing the broker connection.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.queues.clear();
        inner.bindings.clear();
        warn!("Memory broker disconnected");
    }

    /// Accept operations again after [`disconnect`](Self::disconnect).
    /// Queues and bindings dropped by the outage stay gone.
    pub fn restore(&self) {
        self.lock().closed = false;
        debug!("Memory broker restored");
    }

    fn ensure_open(inner: &Inner) -> Result<()> {
        if inner.closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn broker_type(&self) -> &'static str {
        "memory"
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut inner = self.lock();
        Self::ensure_open(&inner)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = inner.queues.get(&name) {
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' already declared with {:?}",
                    name, existing.options
                )));
            }
            return Ok(name);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.queues.insert(
            name.clone(),
            QueueState {
                options,
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                consumers: 0,
            },
        );
        inner.stats.entry(name.clone()).or_default();
        debug!(queue = %name, ?options, "Declared queue");
        Ok(name)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut inner = self.lock();
        Self::ensure_open(&inner)?;

        match inner.exchanges.get(name).copied() {
            Some(existing) if existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' already declared as {}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                inner.exchanges.insert(name.to_string(), kind);
                debug!(exchange = %name, %kind, "Declared exchange");
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::ensure_open(&inner)?;

        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        if !inner.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        let duplicate = inner.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !duplicate {
            inner.bindings.push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let mut inner = self.lock();
        Self::ensure_open(&inner)?;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let kind = *inner
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            inner
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        let stored = StoredMessage {
            body: message.body,
            properties: message.properties,
            routing_key: routing_key.to_string(),
            redelivered: false,
        };

        let mut routed = false;
        for queue in targets {
            routed |= inner.enqueue(&queue, stored.clone());
        }
        if !routed {
            inner.unroutable += 1;
            debug!(exchange = %exchange, routing_key = %routing_key, "Dropping unroutable message");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let rx = {
            let mut inner = self.lock();
            Self::ensure_open(&inner)?;
            let state = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if state.options.exclusive && state.consumers > 0 {
                return Err(BrokerError::ResourceLocked(queue.to_string()));
            }
            state.consumers += 1;
            state.rx.clone()
        };

        let guard = ConsumerGuard {
            inner: Arc::downgrade(&self.inner),
            queue: queue.to_string(),
        };

        let stream = futures::stream::unfold((rx, guard), |(rx, guard)| async move {
            let message = {
                let mut rx = rx.lock().await;
                rx.recv().await?
            };
            guard.mark_dequeued();
            let acker = MemoryAcker {
                inner: guard.inner.clone(),
                queue: guard.queue.clone(),
                message: message.clone(),
                settled: AtomicBool::new(false),
            };
            let delivery = Delivery::new(
                message.body,
                message.properties,
                message.routing_key,
                message.redelivered,
                Box::new(acker),
            );
            Some((Ok::<_, BrokerError>(delivery), (rx, guard)))
        });

        Ok(stream.boxed())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::ensure_open(&inner)?;
        inner.remove_queue(name);
        debug!(queue = %name, "Deleted queue");
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        // Nothing to dial; the broker comes back only through `restore`.
        Self::ensure_open(&self.lock())
    }
}

/// Tracks a live consumer; auto-delete queues vanish with their last consumer.
struct ConsumerGuard {
    inner: Weak<Mutex<Inner>>,
    queue: String,
}

impl ConsumerGuard {
    fn mark_dequeued(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(stats) = inner.stats.get_mut(&self.queue) {
                stats.ready = stats.ready.saturating_sub(1);
            }
        }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        let remove = match inner.queues.get_mut(&self.queue) {
            Some(state) => {
                state.consumers = state.consumers.saturating_sub(1);
                state.options.auto_delete && state.consumers == 0
            }
            None => false,
        };
        if remove {
            inner.remove_queue(&self.queue);
            debug!(queue = %self.queue, "Auto-deleted queue after last consumer");
        }
    }
}

struct MemoryAcker {
    inner: Weak<Mutex<Inner>>,
    queue: String,
    message: StoredMessage,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<Arc<Mutex<Inner>>> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySettled);
        }
        self.inner.upgrade().ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let inner = self.settle()?;
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats.entry(self.queue.clone()).or_default().acked += 1;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let inner = self.settle()?;
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        {
            let stats = inner.stats.entry(self.queue.clone()).or_default();
            stats.rejected += 1;
            if requeue {
                stats.requeued += 1;
            }
        }
        if requeue {
            let mut message = self.message.clone();
            message.redelivered = true;
            inner.enqueue(&self.queue, message);
        }
        Ok(())
    }
}
