//! HTTP binding of the submit/retrieve protocol.
//!
//! Every operation is a JSON `POST`: submissions go to `/api/v1/{op}` and
//! polling goes to `/api/v1/retrieve_future`. Response bodies carry a `type`
//! discriminator for the protocol-level replies (`deferred`, `try_again`,
//! `failed`); any other body is the operation's result payload.

use async_trait::async_trait;
use gradwire_abstraction::{
    ClientError, ClientResult, QueueState, RequestEnvelope, RequestId, RetrieveResponse,
    ServerError, SubmitResponse, Transport, TransportError, TryAgain,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Reply to one HTTP exchange, before protocol decoding.
enum HttpReply {
    Body(Value),
    Backpressure(TryAgain),
}

/// Transport over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base URL of the training service (e.g. "https://train.example.com").
    base_url: String,
    /// Optional bearer token.
    api_key: Option<String>,
    /// HTTP client for making requests.
    client: Client,
}

impl HttpTransport {
    /// Creates a transport without authentication.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), api_key: None, client: Client::new() }
    }

    /// Creates a transport whose individual HTTP calls time out after `request_timeout`.
    ///
    /// # Errors
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn with_request_timeout(
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { base_url: base_url.into(), api_key: None, client })
    }

    /// Sets the API key sent as a bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<HttpReply, TransportError> {
        let url = self.endpoint(path);
        debug!(url = %url, "POST");

        let mut request = self.client.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if let Some(signal) = backpressure_from_status(status, response.headers()) {
            debug!(
                status = status.as_u16(),
                queue_state = %signal.queue_state,
                "Backpressure status"
            );
            return Ok(HttpReply::Backpressure(signal));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Status { status: status.as_u16(), body });
        }

        let value: Value = response.json().await.map_err(|e| {
            TransportError::Decode(format!("Failed to parse response from {}: {}", path, e))
        })?;
        Ok(HttpReply::Body(value))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, request: &RequestEnvelope) -> Result<SubmitResponse, TransportError> {
        match self.post(request.op.path(), &request.body).await? {
            HttpReply::Backpressure(signal) => Ok(SubmitResponse::TryAgain(signal)),
            HttpReply::Body(value) => decode_submit(value),
        }
    }

    async fn retrieve(&self, request_id: &RequestId) -> Result<RetrieveResponse, TransportError> {
        let body = json!({ "request_id": request_id });
        match self.post("retrieve_future", &body).await? {
            HttpReply::Backpressure(signal) => Ok(RetrieveResponse::TryAgain(signal)),
            HttpReply::Body(value) => decode_retrieve(value),
        }
    }
}

fn reply_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Decodes the body of a successful submit call.
pub(crate) fn decode_submit(value: Value) -> Result<SubmitResponse, TransportError> {
    match reply_type(&value) {
        Some("deferred") => {
            let request_id = value
                .get("request_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    TransportError::Decode("deferred reply without request_id".to_string())
                })?;
            Ok(SubmitResponse::Deferred(RequestId::from(request_id)))
        }
        Some("try_again") => decode_try_again(value).map(SubmitResponse::TryAgain),
        Some("failed") => decode_failure(value).map(SubmitResponse::Rejected),
        _ => Ok(SubmitResponse::Inline(value)),
    }
}

/// Decodes the body of a successful retrieve call.
pub(crate) fn decode_retrieve(value: Value) -> Result<RetrieveResponse, TransportError> {
    match reply_type(&value) {
        Some("try_again") => decode_try_again(value).map(RetrieveResponse::TryAgain),
        Some("failed") => decode_failure(value).map(RetrieveResponse::Failed),
        _ => Ok(RetrieveResponse::Completed(value)),
    }
}

fn decode_try_again(value: Value) -> Result<TryAgain, TransportError> {
    serde_json::from_value(value)
        .map_err(|e| TransportError::Decode(format!("Invalid try_again reply: {}", e)))
}

fn decode_failure(value: Value) -> Result<ServerError, TransportError> {
    serde_json::from_value(value)
        .map_err(|e| TransportError::Decode(format!("Invalid failure reply: {}", e)))
}

/// Maps backpressure HTTP statuses to try-again signals.
///
/// 408 means the server's long poll ended without a result; 429 is rate limiting.
fn backpressure_from_status(status: StatusCode, headers: &HeaderMap) -> Option<TryAgain> {
    let queue_state = match status {
        StatusCode::REQUEST_TIMEOUT => QueueState::Unknown,
        StatusCode::TOO_MANY_REQUESTS => QueueState::PausedRateLimit,
        _ => return None,
    };
    Some(TryAgain { queue_state, retry_after_ms: retry_after_ms(headers), reason: None })
}

/// Parses a `Retry-After` header given in (possibly fractional) seconds.
fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let seconds: f64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| (seconds * 1000.0) as u64)
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_decode() {
        TransportError::Decode(error.to_string())
    } else {
        TransportError::Connection(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_decode_submit_variants() {
        let deferred = decode_submit(json!({"type": "deferred", "request_id": "req-1"})).unwrap();
        assert_eq!(deferred, SubmitResponse::Deferred(RequestId::from("req-1")));

        let try_again = decode_submit(json!({
            "type": "try_again",
            "queue_state": "paused_capacity",
            "retry_after_ms": 250
        }))
        .unwrap();
        assert_eq!(
            try_again,
            SubmitResponse::TryAgain(
                TryAgain::new(QueueState::PausedCapacity).with_retry_after_ms(250)
            )
        );

        let inline = decode_submit(json!({"metrics": {}})).unwrap();
        assert_eq!(inline, SubmitResponse::Inline(json!({"metrics": {}})));
    }

    #[test]
    fn test_decode_submit_rejects_deferred_without_id() {
        assert!(matches!(
            decode_submit(json!({"type": "deferred"})),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_retrieve_failure() {
        let failed = decode_retrieve(json!({
            "type": "failed",
            "error": "loss diverged",
            "category": "user"
        }))
        .unwrap();
        match failed {
            RetrieveResponse::Failed(error) => {
                assert_eq!(error.message, "loss diverged");
                assert_eq!(error.category.as_deref(), Some("user"));
                assert!(!error.retryable);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_backpressure_from_status() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));

        let signal = backpressure_from_status(StatusCode::TOO_MANY_REQUESTS, &headers).unwrap();
        assert_eq!(signal.queue_state, QueueState::PausedRateLimit);
        assert_eq!(signal.retry_after_ms, Some(1500));

        let signal =
            backpressure_from_status(StatusCode::REQUEST_TIMEOUT, &HeaderMap::new()).unwrap();
        assert_eq!(signal.queue_state, QueueState::Unknown);
        assert_eq!(signal.retry_after_ms, None);

        assert!(backpressure_from_status(StatusCode::BAD_REQUEST, &headers).is_none());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let transport = HttpTransport::new("http://localhost:8000/");
        assert_eq!(transport.endpoint("forward"), "http://localhost:8000/api/v1/forward");
    }
}
