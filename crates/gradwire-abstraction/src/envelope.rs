//! Envelopes of the submit/retrieve protocol.

use crate::types::ForwardBackwardInput;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Opaque server token correlating a submission with its later retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Server-reported reason a request has not been scheduled yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Requests are being scheduled normally.
    Active,
    /// The account hit its concurrent request rate limit.
    PausedRateLimit,
    /// The service is out of capacity.
    PausedCapacity,
    /// Any state this client does not know about.
    #[serde(other)]
    Unknown,
}

impl QueueState {
    /// Human-readable reason used when the server does not supply one.
    pub fn default_reason(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PausedRateLimit => "concurrent training requests rate limit hit",
            Self::PausedCapacity => "out of capacity",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::PausedRateLimit => "paused_rate_limit",
            Self::PausedCapacity => "paused_capacity",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Backpressure signal: the request was not scheduled and should be retried later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryAgain {
    /// Why the request is waiting.
    pub queue_state: QueueState,
    /// Server-suggested delay before the next attempt.
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
    /// Optional server-supplied explanation.
    #[serde(default)]
    pub reason: Option<String>,
}

impl TryAgain {
    /// Creates a try-again signal with no suggested delay.
    #[must_use]
    pub fn new(queue_state: QueueState) -> Self {
        Self { queue_state, retry_after_ms: None, reason: None }
    }

    /// Sets the suggested delay.
    #[must_use]
    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// The reason to report to observers.
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| self.queue_state.default_reason())
    }
}

/// Structured failure reported by the server for a submitted operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}{}", .category.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct ServerError {
    /// Error message.
    #[serde(alias = "error")]
    pub message: String,
    /// Optional error category (e.g. "user", "server").
    #[serde(default)]
    pub category: Option<String>,
    /// Whether the server allows resubmitting the operation.
    #[serde(default)]
    pub retryable: bool,
}

impl ServerError {
    /// Creates a non-retryable server error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), category: None, retryable: false }
    }

    /// Marks the error as retryable.
    #[must_use]
    pub fn mark_retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// Operations the training service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read-only forward pass.
    Forward,
    /// Forward pass plus gradient accumulation.
    ForwardBackward,
    /// Optimizer update from accumulated gradients.
    OptimStep,
}

impl OperationKind {
    /// Path segment of the operation's submit endpoint.
    pub fn path(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::ForwardBackward => "forward_backward",
            Self::OptimStep => "optim_step",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// A request as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Operation to run.
    pub op: OperationKind,
    /// Operation body, already serialized.
    pub body: Value,
}

impl RequestEnvelope {
    /// Creates a new envelope.
    #[must_use]
    pub fn new(op: OperationKind, body: Value) -> Self {
        Self { op, body }
    }

    /// Decodes the forward input carried by a forward or forward-backward body.
    pub fn forward_input(&self) -> Option<ForwardBackwardInput> {
        self.body
            .get("forward_input")
            .and_then(|input| serde_json::from_value(input.clone()).ok())
    }

    /// Sequence number stamped by the training client, if any.
    pub fn seq_id(&self) -> Option<u64> {
        self.body.get("seq_id").and_then(Value::as_u64)
    }
}

/// Outcome of a submit call.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResponse {
    /// The server computed the result synchronously.
    Inline(Value),
    /// The server accepted the request; retrieve the result with this id.
    Deferred(RequestId),
    /// The server did not admit the request.
    TryAgain(TryAgain),
    /// The server refused the request outright (e.g. failed validation).
    Rejected(ServerError),
}

/// Outcome of a retrieve call.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrieveResponse {
    /// The operation finished; the payload is its result.
    Completed(Value),
    /// The operation failed.
    Failed(ServerError),
    /// The operation is not finished yet.
    TryAgain(TryAgain),
}
