// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! coderun worker - sandboxed code execution over a message broker
//!
//! Consumes [`RunCodeTask`](coderun_protocol::RunCodeTask) requests from a
//! shared queue, runs each in an isolated sandbox and publishes the
//! [`RunResult`](coderun_protocol::RunResult) to the caller's reply queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   task queue   ┌────────────┐   execute   ┌──────────┐
//! │   broker     │ ─────────────▶ │ RpcWorker  │ ──────────▶ │ Executor │
//! │ (AMQP/memory)│ ◀───────────── │ (dispatch) │ ◀────────── │          │
//! └──────────────┘  reply queue   └────────────┘   result    └────┬─────┘
//!                                                                 │ build/run/wait
//!                                                                 ▼
//!                                                         ┌────────────────┐
//!                                                         │ SandboxExecutor│
//!                                                         │ (docker/mock)  │
//!                                                         └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`worker`]: receive loop, admission control, failure policy
//! - [`executor`]: task → sandbox → result orchestration
//! - [`sandbox`]: sandbox traits and the docker/mock backends
//! - [`settings`]: language table and limits
//! - [`runtime`]: embeddable runtime builder
//! - [`config`]: environment configuration for the binary

pub mod config;
pub mod error;
pub mod executor;
pub mod runtime;
pub mod sandbox;
pub mod settings;
pub mod worker;

pub use error::{Result, WorkerError};
pub use executor::{ExecutionError, Executor};
pub use runtime::WorkerRuntime;
pub use settings::Settings;
pub use worker::{FailurePolicy, RpcWorker, RpcWorkerConfig, WorkerStatsSnapshot};
