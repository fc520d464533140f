// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for coderun-client tests.
//!
//! Stands in for a worker by consuming the task queue of an in-memory broker
//! and publishing hand-made replies.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coderun_client::{ClientConfig, RpcClient};
use coderun_protocol::{
    Broker, DEFAULT_EXCHANGE, DeliveryStream, Envelope, MemoryBroker, MessageProperties,
    OutgoingMessage, RunCodeTask, RunResult,
};
use futures::StreamExt;

pub const TASK_QUEUE: &str = "code_run";

/// Client config for the in-memory broker.
pub fn config() -> ClientConfig {
    ClientConfig {
        amqp_url: "memory://".to_string(),
        task_queue: TASK_QUEUE.to_string(),
        task_exchange: None,
        default_timeout: None,
    }
}

/// A broker, a connected client and a consumer on the task queue.
pub async fn setup_with(config: ClientConfig) -> (MemoryBroker, RpcClient, DeliveryStream) {
    let broker = MemoryBroker::new();
    let client = RpcClient::connect(Arc::new(broker.clone()), &config)
        .await
        .unwrap();
    let tasks = broker.consume(&config.task_queue).await.unwrap();
    (broker, client, tasks)
}

pub async fn setup() -> (MemoryBroker, RpcClient, DeliveryStream) {
    setup_with(config()).await
}

/// Next task on the task queue, acked. Panics after two seconds.
pub async fn next_task(tasks: &mut DeliveryStream) -> Envelope<RunCodeTask> {
    let delivery = tokio::time::timeout(Duration::from_secs(2), tasks.next())
        .await
        .expect("timed out waiting for a task")
        .expect("task stream ended")
        .unwrap();
    delivery.ack().await.unwrap();
    Envelope::<RunCodeTask>::from_delivery(&delivery).unwrap()
}

/// Answer `task` the way a worker would.
pub async fn reply(broker: &MemoryBroker, task: &Envelope<RunCodeTask>, result: RunResult) {
    let message = Envelope::new(result)
        .with_correlation_id(task.correlation_id.clone().unwrap())
        .to_message()
        .unwrap();
    broker
        .publish(DEFAULT_EXCHANGE, task.reply_to.as_deref().unwrap(), message)
        .await
        .unwrap();
}

/// Publish a raw body to a reply queue.
pub async fn reply_raw(
    broker: &MemoryBroker,
    reply_queue: &str,
    correlation_id: Option<&str>,
    body: &[u8],
) {
    broker
        .publish(
            DEFAULT_EXCHANGE,
            reply_queue,
            OutgoingMessage {
                body: Bytes::copy_from_slice(body),
                properties: MessageProperties {
                    correlation_id: correlation_id.map(str::to_string),
                    reply_to: None,
                },
            },
        )
        .await
        .unwrap();
}

/// A successful result whose logs are `lines`.
pub fn success(lines: &[&str]) -> RunResult {
    RunResult {
        ok: true,
        execution_time: 0.02,
        logs: lines.iter().map(|l| l.to_string()).collect(),
        time_limit: false,
        memory_limit: false,
        runtime_error: false,
        error: None,
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
