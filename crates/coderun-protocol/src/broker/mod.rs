// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker transports.
//!
//! This module provides the store-and-forward layer both sides talk through:
//! - `memory`: in-process broker with AMQP routing semantics (tests, embedding)
//! - `amqp`: AMQP 0-9-1 broker via lapin (default)

#[cfg(feature = "amqp")]
pub mod amqp;

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use memory::MemoryBroker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

/// Name of the broker's unnamed exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Errors from broker operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// Could not reach the broker or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// Queue was redeclared with different properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Exclusive queue is already owned by another consumer.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// Queue does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Exchange does not exist.
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Delivery was already acked or rejected.
    #[error("delivery already settled")]
    AlreadySettled,

    /// Broker handle has been closed.
    #[error("broker closed")]
    Closed,

    /// Error reported by the AMQP client.
    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Transport-level properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Token matching a reply to its request.
    pub correlation_id: Option<String>,
    /// Queue the reply must be routed to.
    pub reply_to: Option<String>,
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Encoded domain fields.
    pub body: Bytes,
    /// Correlation metadata.
    pub properties: MessageProperties,
}

/// Flags used when declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Only the declaring connection may consume it.
    pub exclusive: bool,
    /// Removed once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Shared work queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private reply queue owned by a single client.
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Exchange routing kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on exact binding key match.
    Direct,
    /// Route to every bound queue.
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Mark the delivery as consumed.
    async fn ack(&self) -> Result<()>;

    /// Discard the delivery, optionally putting it back on the queue.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message received from a queue.
pub struct Delivery {
    /// Encoded domain fields.
    pub body: Bytes,
    /// Correlation metadata.
    pub properties: MessageProperties,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// The broker delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Assemble a delivery from its parts.
    pub fn new(
        body: Bytes,
        properties: MessageProperties,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            body,
            properties,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    /// Correlation id property, if set.
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    /// Acknowledge the delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the delivery.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries from one queue. Ends when the consumer is cancelled
/// or the connection drops.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Broker operations consumed by workers and clients.
///
/// Implementations must serialize publish/ack/reject per channel; callers may
/// share one handle across many tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker type identifier (e.g., "amqp", "memory").
    fn broker_type(&self) -> &'static str;

    /// Declare a queue. Redeclaring with identical options is a no-op.
    ///
    /// An empty name asks the broker to generate one; the actual name is
    /// returned.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Declare an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Bind a queue to an exchange under a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message. Unroutable messages are dropped by the broker.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Delete a queue regardless of consumers or pending messages.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Re-establish a lost connection. A no-op while the connection is
    /// healthy. Queues, exchanges and bindings must be declared again
    /// afterwards.
    async fn reconnect(&self) -> Result<()>;
}
