//! Error types shared by the transport, the future engine and the gradient relay.

use crate::envelope::{QueueState, ServerError};
use std::time::Duration;
use thiserror::Error;

/// A failure of the network binding itself, before any server verdict is known.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established or was reset.
    #[error("Connection Error: {0}")]
    Connection(String),

    /// The request did not complete within the transport's own timeout.
    #[error("Request Timeout: {0}")]
    Timeout(String),

    /// The server answered with a status the protocol does not map to a verdict.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Decode Error: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the retry policy may reattempt after this failure.
    ///
    /// Connection errors, transport timeouts and 5xx statuses are transient;
    /// everything else is a property of the request and will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => (500..=599).contains(status),
            Self::Decode(_) => false,
        }
    }
}

/// Every caller-visible outcome other than success.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// A non-retryable transport failure.
    #[error("Transport Error: {0}")]
    Transport(TransportError),

    /// Retryable transport failures persisted past the retry policy's bound.
    #[error("Transport exhausted after {attempts} attempts: {last_error}")]
    TransportExhausted {
        /// Number of transport calls made.
        attempts: u32,
        /// The failure observed on the final attempt.
        last_error: TransportError,
    },

    /// The server reported the operation as failed.
    #[error("Server Error: {0}")]
    Server(#[from] ServerError),

    /// The caller's deadline elapsed; the future remains valid and may be polled again.
    #[error("Timeout exceeded after {elapsed:?}")]
    TimeoutExceeded {
        /// Time spent in the poll call that timed out.
        elapsed: Duration,
    },

    /// The caller cancelled the wait.
    #[error("Polling cancelled")]
    Cancelled,

    /// The caller's backpressure bound was reached while the server kept asking to try again.
    #[error(
        "Backpressure persisted after {attempts} try-again replies (queue state: {queue_state})"
    )]
    BackpressureExhausted {
        /// Last queue state reported by the server.
        queue_state: QueueState,
        /// Number of try-again replies observed.
        attempts: u32,
    },

    /// The local loss closure failed or produced an undefined gradient.
    #[error("Gradient Computation Error: {0}")]
    GradientComputation(String),

    /// Per-datum logprob or gradient structure did not match the input data.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Expected element count.
        expected: usize,
        /// Observed element count.
        actual: usize,
    },

    /// A payload could not be serialized or deserialized.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// The client was configured inconsistently.
    #[error("Configuration Error: {0}")]
    Config(String),
}

impl ClientError {
    /// Stable snake_case tag for logs and structured output.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::TransportExhausted { .. } => "transport_exhausted",
            Self::Server(_) => "server_error",
            Self::TimeoutExceeded { .. } => "timeout_exceeded",
            Self::Cancelled => "cancelled",
            Self::BackpressureExhausted { .. } => "backpressure_exhausted",
            Self::GradientComputation(_) => "gradient_computation_error",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::Serialization(_) => "serialization_error",
            Self::Config(_) => "config_error",
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias used across the client crates.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_retryability() {
        assert!(TransportError::Connection("reset".to_string()).is_retryable());
        assert!(TransportError::Timeout("30s".to_string()).is_retryable());
        assert!(TransportError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!TransportError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!TransportError::Decode("bad json".to_string()).is_retryable());
    }

    #[test]
    fn test_client_error_tags() {
        let exhausted = ClientError::TransportExhausted {
            attempts: 4,
            last_error: TransportError::Connection("refused".to_string()),
        };
        assert_eq!(exhausted.tag(), "transport_exhausted");
        assert!(exhausted.to_string().contains("4 attempts"));

        let timeout = ClientError::TimeoutExceeded { elapsed: Duration::from_millis(50) };
        assert_eq!(timeout.tag(), "timeout_exceeded");
    }
}
