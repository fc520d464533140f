// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task and result envelopes.
//!
//! The message body only ever carries the domain fields, serialized as JSON.
//! `correlation_id` and `reply_to` travel as transport-level message
//! properties and are attached to the decoded value afterwards.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::{Delivery, MessageProperties, OutgoingMessage};

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The body is not well-formed or misses a required field.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    /// The body could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// A transport property required to route a reply is absent.
    #[error("missing message property: {0}")]
    MissingProperty(&'static str),
}

/// Domain payloads that can travel inside an [`Envelope`].
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Serialize the domain fields into a message body.
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    /// Parse a message body. Never yields a partially populated value.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::MalformedPayload)
    }
}

/// A request to run a piece of source code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCodeTask {
    /// Source text to execute.
    pub code: String,
    /// Language name, looked up in the worker's settings.
    pub language: String,
    /// Language version, looked up under the language.
    pub language_version: String,
    /// Data fed to the program's standard input.
    #[serde(default)]
    pub stdin: String,
}

impl RunCodeTask {
    /// Create a task with empty stdin.
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        language_version: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            language_version: language_version.into(),
            stdin: String::new(),
        }
    }

    /// Set the data fed to standard input.
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }
}

impl Payload for RunCodeTask {}

/// Outcome of running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// True iff the program exited with status zero.
    pub ok: bool,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    /// Combined output lines in the order they were produced.
    pub logs: Vec<String>,
    /// The sandbox reported that the CPU/time limit was exceeded.
    #[serde(default)]
    pub time_limit: bool,
    /// The sandbox reported that the memory limit was exceeded.
    #[serde(default)]
    pub memory_limit: bool,
    /// The program did not exit cleanly.
    #[serde(default)]
    pub runtime_error: bool,
    /// Worker-side failure description, set when the task could not be run at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    /// Result synthesized by a worker when execution itself failed.
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            ok: false,
            execution_time: 0.0,
            logs: vec![error.clone()],
            time_limit: false,
            memory_limit: false,
            runtime_error: true,
            error: Some(error),
        }
    }
}

impl Payload for RunResult {}

/// A domain payload plus its correlation metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    /// Domain fields (the message body).
    pub body: T,
    /// Token matching a reply to its request.
    pub correlation_id: Option<String>,
    /// Queue the reply must be routed to.
    pub reply_to: Option<String>,
}

impl<T: Payload> Envelope<T> {
    /// Wrap a payload without metadata.
    pub fn new(body: T) -> Self {
        Self {
            body,
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply address.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Encode into a message: body from the payload, metadata as properties.
    pub fn to_message(&self) -> Result<OutgoingMessage, CodecError> {
        Ok(OutgoingMessage {
            body: Bytes::from(self.body.encode()?),
            properties: MessageProperties {
                correlation_id: self.correlation_id.clone(),
                reply_to: self.reply_to.clone(),
            },
        })
    }

    /// Decode a body and attach the given transport properties.
    pub fn decode(body: &[u8], properties: &MessageProperties) -> Result<Self, CodecError> {
        let body = T::decode(body)?;
        Ok(Self {
            body,
            correlation_id: properties.correlation_id.clone(),
            reply_to: properties.reply_to.clone(),
        })
    }

    /// Decode a received delivery.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, CodecError> {
        Self::decode(&delivery.body, &delivery.properties)
    }

    /// Correlation id, or an error if the sender did not set one.
    pub fn require_correlation_id(&self) -> Result<&str, CodecError> {
        self.correlation_id
            .as_deref()
            .ok_or(CodecError::MissingProperty("correlation_id"))
    }

    /// Reply address, or an error if the sender did not set one.
    pub fn require_reply_to(&self) -> Result<&str, CodecError> {
        self.reply_to
            .as_deref()
            .ok_or(CodecError::MissingProperty("reply_to"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> RunCodeTask {
        RunCodeTask::new("print(1)", "python", "3.11")
    }

    #[test]
    fn test_task_body_excludes_metadata() {
        let envelope = Envelope::new(task())
            .with_correlation_id("abc")
            .with_reply_to("amq.gen-1");
        let message = envelope.to_message().unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
        assert!(raw.get("correlation_id").is_none());
        assert!(raw.get("reply_to").is_none());
        assert_eq!(raw["code"], "print(1)");
        assert_eq!(message.properties.correlation_id.as_deref(), Some("abc"));
        assert_eq!(message.properties.reply_to.as_deref(), Some("amq.gen-1"));
    }

    #[test]
    fn test_task_round_trip_with_metadata() {
        let envelope = Envelope::new(task().with_stdin("42\n"))
            .with_correlation_id("abc")
            .with_reply_to("callback");
        let message = envelope.to_message().unwrap();

        let decoded =
            Envelope::<RunCodeTask>::decode(&message.body, &message.properties).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_result_round_trip() {
        let result = RunResult {
            ok: false,
            execution_time: 1.25,
            logs: vec!["Traceback".to_string(), "ZeroDivisionError".to_string()],
            time_limit: true,
            memory_limit: false,
            runtime_error: true,
            error: None,
        };
        let bytes = result.encode().unwrap();
        assert_eq!(RunResult::decode(&bytes).unwrap(), result);
    }

    #[test]
    fn test_stdin_defaults_to_empty() {
        let body = br#"{"code":"x","language":"python","language_version":"3.11"}"#;
        let task = RunCodeTask::decode(body).unwrap();
        assert_eq!(task.stdin, "");
    }

    #[test]
    fn test_result_flags_default_to_false() {
        let body = br#"{"ok":true,"execution_time":0.5,"logs":["1"]}"#;
        let result = RunResult::decode(body).unwrap();
        assert!(!result.time_limit);
        assert!(!result.memory_limit);
        assert!(!result.runtime_error);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let body = br#"{"code":"x","language":"python"}"#;
        let err = RunCodeTask::decode(body).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = RunResult::decode(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
        assert!(err.to_string().starts_with("malformed payload"));
    }

    #[test]
    fn test_failure_result_shape() {
        let result = RunResult::failure("unknown language: cobol");
        assert!(!result.ok);
        assert!(result.runtime_error);
        assert!(!result.time_limit);
        assert_eq!(result.error.as_deref(), Some("unknown language: cobol"));
        assert_eq!(result.logs, vec!["unknown language: cobol".to_string()]);
    }

    #[test]
    fn test_require_properties() {
        let envelope = Envelope::new(task());
        assert!(matches!(
            envelope.require_reply_to(),
            Err(CodecError::MissingProperty("reply_to"))
        ));
        let envelope = envelope.with_correlation_id("id-1");
        assert_eq!(envelope.require_correlation_id().unwrap(), "id-1");
    }
}
