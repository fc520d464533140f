// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envelope transport tests for coderun-protocol.

use bytes::Bytes;
use coderun_protocol::{
    Broker, CodecError, DEFAULT_EXCHANGE, Envelope, MemoryBroker, MessageProperties,
    OutgoingMessage, Payload, QueueOptions, RunCodeTask, RunResult,
};
use futures::StreamExt;

async fn broker_with_queue(name: &str) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker
        .declare_queue(name, QueueOptions::durable())
        .await
        .unwrap();
    broker
}

// ============================================================================
// Task envelopes
// ============================================================================

#[tokio::test]
async fn test_task_metadata_survives_transport() {
    let broker = broker_with_queue("code_run").await;
    let mut stream = broker.consume("code_run").await.unwrap();

    let sent = Envelope::new(RunCodeTask::new("print(1)", "python", "3.11"))
        .with_correlation_id("abc")
        .with_reply_to("amq.gen-reply");
    broker
        .publish(DEFAULT_EXCHANGE, "code_run", sent.to_message().unwrap())
        .await
        .unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    let received = Envelope::<RunCodeTask>::from_delivery(&delivery).unwrap();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn test_properties_come_from_transport_not_body() {
    let broker = broker_with_queue("code_run").await;
    let mut stream = broker.consume("code_run").await.unwrap();

    // A body that smuggles metadata fields must not override the properties.
    let body = br#"{"code":"x","language":"python","language_version":"3.11","correlation_id":"forged","reply_to":"forged"}"#;
    broker
        .publish(
            DEFAULT_EXCHANGE,
            "code_run",
            OutgoingMessage {
                body: Bytes::from_static(body),
                properties: MessageProperties {
                    correlation_id: Some("real".to_string()),
                    reply_to: Some("real-reply".to_string()),
                },
            },
        )
        .await
        .unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    let received = Envelope::<RunCodeTask>::from_delivery(&delivery).unwrap();
    assert_eq!(received.correlation_id.as_deref(), Some("real"));
    assert_eq!(received.reply_to.as_deref(), Some("real-reply"));
}

#[tokio::test]
async fn test_malformed_delivery_fails_without_partial_value() {
    let broker = broker_with_queue("code_run").await;
    let mut stream = broker.consume("code_run").await.unwrap();

    broker
        .publish(
            DEFAULT_EXCHANGE,
            "code_run",
            OutgoingMessage {
                body: Bytes::from_static(b"{\"code\": 1}"),
                properties: MessageProperties {
                    correlation_id: Some("abc".to_string()),
                    reply_to: None,
                },
            },
        )
        .await
        .unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    let err = Envelope::<RunCodeTask>::from_delivery(&delivery).unwrap_err();
    assert!(matches!(err, CodecError::MalformedPayload(_)));
}

// ============================================================================
// Result envelopes
// ============================================================================

#[test]
fn test_result_decode_is_inverse_of_encode() {
    let results = [
        RunResult {
            ok: true,
            execution_time: 0.031,
            logs: vec!["1".to_string()],
            time_limit: false,
            memory_limit: false,
            runtime_error: false,
            error: None,
        },
        RunResult {
            ok: false,
            execution_time: 5.0,
            logs: vec![],
            time_limit: true,
            memory_limit: true,
            runtime_error: true,
            error: None,
        },
        RunResult::failure("sandbox failed to start"),
    ];

    for result in results {
        let bytes = result.encode().unwrap();
        assert_eq!(RunResult::decode(&bytes).unwrap(), result);
    }
}

#[test]
fn test_result_envelope_carries_correlation() {
    let envelope = Envelope::new(RunResult::failure("boom")).with_correlation_id("abc");
    let message = envelope.to_message().unwrap();
    assert_eq!(message.properties.correlation_id.as_deref(), Some("abc"));
    assert!(message.properties.reply_to.is_none());

    let decoded = Envelope::<RunResult>::decode(&message.body, &message.properties).unwrap();
    assert_eq!(decoded, envelope);
}
