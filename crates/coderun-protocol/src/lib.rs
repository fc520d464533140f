// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! coderun protocol - envelopes and broker transports
//!
//! This crate provides the wire contract shared by:
//! - Workers that consume run requests (coderun-worker)
//! - Callers that submit them and wait for results (coderun-client)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    coderun-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelopes: RunCodeTask / RunResult + correlation metadata  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON body, metadata as message properties   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: AMQP (lapin) or in-process MemoryBroker         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Routing
//!
//! | Message | Exchange | Routing key |
//! |---------|----------|-------------|
//! | `RunCodeTask` | task exchange or default | shared task queue name |
//! | `RunResult` | default (`""`) | caller's private reply queue |
//!
//! # Usage
//!
//! ```ignore
//! use coderun_protocol::{Envelope, RunCodeTask, broker::{Broker, MemoryBroker}};
//!
//! let broker = MemoryBroker::new();
//! let message = Envelope::new(RunCodeTask::new("print(1)", "python", "3.11"))
//!     .with_correlation_id("abc")
//!     .with_reply_to("amq.gen-42")
//!     .to_message()?;
//! broker.publish("", "code_run", message).await?;
//! ```

pub mod broker;
pub mod envelope;

pub use broker::{
    Broker, BrokerError, DEFAULT_EXCHANGE, Delivery, DeliveryStream, ExchangeKind, MemoryBroker,
    MessageProperties, OutgoingMessage, QueueOptions,
};
#[cfg(feature = "amqp")]
pub use broker::AmqpBroker;
pub use envelope::{CodecError, Envelope, Payload, RunCodeTask, RunResult};
