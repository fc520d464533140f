// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for coderun-worker.

use coderun_protocol::{BrokerError, CodecError};
use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Broker operation failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Envelope encoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The task consumer stream ended.
    #[error("Task consumer closed")]
    ConsumerClosed,
}

/// Result type using WorkerError.
pub type Result<T> = std::result::Result<T, WorkerError>;
