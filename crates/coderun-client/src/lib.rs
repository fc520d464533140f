// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! coderun client - submit code, await correlated results
//!
//! Publishes [`RunCodeTask`](coderun_protocol::RunCodeTask)s to the shared
//! task queue and resolves each caller's future when the matching
//! [`RunResult`](coderun_protocol::RunResult) arrives on the client's
//! private reply queue.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use coderun_client::{ClientConfig, RpcClient};
//! use coderun_protocol::AmqpBroker;
//!
//! let config = ClientConfig::from_env()?;
//! let broker = Arc::new(AmqpBroker::connect(&config.amqp_url).await?);
//! let client = RpcClient::connect(broker, &config).await?;
//!
//! let result = client.run("print(1)", "python", "3.11", "").await?;
//! assert_eq!(result.logs, vec!["1"]);
//! client.close().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{PendingResult, RpcClient};
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, Result};
