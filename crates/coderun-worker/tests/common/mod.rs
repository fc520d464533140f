// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for coderun-worker tests.
//!
//! Provides a toy interpreter for the mock sandbox and helpers to talk to a
//! worker through the in-memory broker.

#![allow(dead_code)]

use std::time::Duration;

use coderun_protocol::{
    Broker, DEFAULT_EXCHANGE, DeliveryStream, Envelope, MemoryBroker, QueueOptions, RunCodeTask,
    RunResult,
};
use coderun_worker::sandbox::{MockOutcome, MockSandboxExecutor, SandboxSpec};
use coderun_worker::settings::Settings;
use futures::StreamExt;

pub const TASK_QUEUE: &str = "code_run";

/// Settings with a single python 3.11 entry.
pub fn python_settings() -> Settings {
    Settings::from_json(
        r#"{
            "limits": { "time_secs": 2, "memory_mb": 64, "cpu_count": 1, "pids_limit": 16 },
            "languages": {
                "python": {
                    "file_name": "main.py",
                    "versions": {
                        "3.11": { "image": "python:3.11-slim", "command": "python {file}" }
                    }
                }
            }
        }"#,
    )
    .unwrap()
}

/// Interpret the source file line by line:
/// - `print(x)` writes `x` to stdout
/// - `warn(x)` writes `x` to stderr
/// - `exit(n)` stops with exit code `n`
/// - `input()` echoes stdin
/// - `while True: pass` hits the time limit
/// - `alloc()` hits the memory limit
pub fn interpret(spec: &SandboxSpec, stdin: &str) -> MockOutcome {
    let source = spec
        .files
        .first()
        .map(|f| f.content.clone())
        .unwrap_or_default();

    let mut outcome = MockOutcome::exited(0).duration(Duration::from_millis(12));
    for line in source.lines().map(str::trim) {
        if let Some(arg) = line.strip_prefix("print(").and_then(|l| l.strip_suffix(')')) {
            outcome = outcome.stdout(arg);
        } else if let Some(arg) = line.strip_prefix("warn(").and_then(|l| l.strip_suffix(')')) {
            outcome = outcome.stderr(arg);
        } else if let Some(arg) = line.strip_prefix("exit(").and_then(|l| l.strip_suffix(')')) {
            outcome.exit_code = arg.parse().ok();
            return outcome;
        } else if line == "input()" {
            for input in stdin.lines() {
                outcome = outcome.stdout(input);
            }
        } else if line == "while True: pass" {
            outcome.exit_code = Some(137);
            return outcome.time_limit().duration(spec.limits.time_limit());
        } else if line == "alloc()" {
            outcome.exit_code = Some(137);
            return outcome.memory_limit();
        }
    }
    outcome
}

/// Mock sandbox running [`interpret`].
pub fn interpreter() -> MockSandboxExecutor {
    MockSandboxExecutor::with_script(interpret)
}

/// A private reply queue and its consumer.
pub async fn reply_queue(broker: &MemoryBroker) -> (String, DeliveryStream) {
    let name = broker
        .declare_queue("", QueueOptions::private())
        .await
        .unwrap();
    let stream = broker.consume(&name).await.unwrap();
    (name, stream)
}

/// Publish a task to the task queue through the default exchange.
pub async fn send_task(broker: &MemoryBroker, task: RunCodeTask, correlation_id: &str, reply_to: &str) {
    let message = Envelope::new(task)
        .with_correlation_id(correlation_id)
        .with_reply_to(reply_to)
        .to_message()
        .unwrap();
    broker
        .publish(DEFAULT_EXCHANGE, TASK_QUEUE, message)
        .await
        .unwrap();
}

/// Next result on a reply stream, acked. Panics after two seconds.
pub async fn next_result(stream: &mut DeliveryStream) -> Envelope<RunResult> {
    let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for a result")
        .expect("reply stream ended")
        .unwrap();
    delivery.ack().await.unwrap();
    Envelope::<RunResult>::from_delivery(&delivery).unwrap()
}

/// Assert nothing arrives on a reply stream for `wait`.
pub async fn assert_no_result(stream: &mut DeliveryStream, wait: Duration) {
    if let Ok(Some(delivery)) = tokio::time::timeout(wait, stream.next()).await {
        panic!("unexpected reply: {:?}", delivery);
    }
}

/// Poll `condition` until it holds. Panics after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
