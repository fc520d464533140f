// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for coderun-client.

use std::time::Duration;

use coderun_protocol::{BrokerError, CodecError};
use thiserror::Error;

/// Errors surfaced to callers of [`RpcClient`](crate::RpcClient).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Broker operation failed (declare, publish, delete).
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The task could not be encoded or the result could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No result arrived before the deadline.
    #[error("no result within {0:?}")]
    Timeout(Duration),

    /// The client went away before a result arrived.
    #[error("client closed")]
    Closed,
}

/// Result type using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;
