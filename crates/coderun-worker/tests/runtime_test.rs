// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use coderun_protocol::{MemoryBroker, RunCodeTask};
use coderun_worker::runtime::WorkerRuntime;
use coderun_worker::worker::FailurePolicy;

use common::*;

#[test]
fn test_builder_requires_collaborators() {
    let missing_broker = WorkerRuntime::builder()
        .sandbox(Arc::new(interpreter()))
        .settings(python_settings())
        .build();
    assert!(
        missing_broker
            .err()
            .unwrap()
            .to_string()
            .contains("broker is required")
    );

    let missing_settings = WorkerRuntime::builder()
        .broker(Arc::new(MemoryBroker::new()))
        .sandbox(Arc::new(interpreter()))
        .build();
    assert!(
        missing_settings
            .err()
            .unwrap()
            .to_string()
            .contains("settings are required")
    );
}

#[tokio::test]
async fn test_runtime_serves_and_shuts_down() {
    let broker = MemoryBroker::new();
    let runtime = WorkerRuntime::builder()
        .broker(Arc::new(broker.clone()))
        .sandbox(Arc::new(interpreter()))
        .settings(python_settings())
        .queue_name("runs")
        .exchange_name("")
        .max_concurrent_tasks(4)
        .failure_policy(FailurePolicy::ReplyWithFailure)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(runtime.queue(), "runs");

    let (reply_to, mut replies) = reply_queue(&broker).await;
    let message = coderun_protocol::Envelope::new(RunCodeTask::new("print(hi)", "python", "3.11"))
        .with_correlation_id("rt")
        .with_reply_to(&reply_to)
        .to_message()
        .unwrap();
    coderun_protocol::Broker::publish(&broker, "", "runs", message)
        .await
        .unwrap();

    let reply = next_result(&mut replies).await;
    assert_eq!(reply.body.logs, vec!["hi"]);
    wait_until(|| runtime.stats().replied == 1).await;
    assert!(!runtime.is_finished());

    tokio::time::timeout(Duration::from_secs(2), runtime.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker.consumer_count("runs"), 0);
}

#[tokio::test]
async fn test_run_until_returns_on_signal() {
    let broker = MemoryBroker::new();
    let runtime = WorkerRuntime::builder()
        .broker(Arc::new(broker.clone()))
        .sandbox(Arc::new(interpreter()))
        .settings(python_settings())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(runtime.run_until(async move {
        let _ = rx.await;
    }));

    tx.send(()).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_runtime_reconnects_after_outage() {
    let broker = MemoryBroker::new();
    let runtime = WorkerRuntime::builder()
        .broker(Arc::new(broker.clone()))
        .sandbox(Arc::new(interpreter()))
        .settings(python_settings())
        .reconnect_backoff(Duration::from_millis(10))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let watched = broker.clone();
    wait_until(|| watched.consumer_count(TASK_QUEUE) == 1).await;

    broker.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!runtime.is_finished());

    broker.restore();
    wait_until(|| watched.consumer_count(TASK_QUEUE) == 1).await;

    let (reply_to, mut replies) = reply_queue(&broker).await;
    send_task(&broker, RunCodeTask::new("print(1)", "python", "3.11"), "after", &reply_to).await;
    let reply = next_result(&mut replies).await;
    assert_eq!(reply.correlation_id.as_deref(), Some("after"));
    assert_eq!(reply.body.logs, vec!["1"]);

    tokio::time::timeout(Duration::from_secs(2), runtime.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_during_outage() {
    let broker = MemoryBroker::new();
    let runtime = WorkerRuntime::builder()
        .broker(Arc::new(broker.clone()))
        .sandbox(Arc::new(interpreter()))
        .settings(python_settings())
        .reconnect_backoff(Duration::from_millis(10))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let watched = broker.clone();
    wait_until(|| watched.consumer_count(TASK_QUEUE) == 1).await;
    broker.disconnect();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), runtime.shutdown())
        .await
        .unwrap();
    assert!(outcome.is_ok());
}
