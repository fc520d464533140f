// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox module - isolated execution backends.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::{DockerSandboxConfig, DockerSandboxExecutor};
pub use mock::{MockOutcome, MockSandboxExecutor, MockStage};
pub use traits::*;
