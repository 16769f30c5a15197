//! The network seam between the client runtime and the training service.

use crate::envelope::{RequestEnvelope, RequestId, RetrieveResponse, SubmitResponse};
use crate::error::TransportError;
use async_trait::async_trait;

/// A binding of the submit/retrieve protocol to some network.
///
/// Implementations make exactly one network exchange per call; retry,
/// backpressure and polling belong to the caller.
/// All transports must be `Send + Sync` so one instance can serve concurrent futures.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submits a request.
    ///
    /// # Errors
    /// Returns a `TransportError` if no protocol-level answer was obtained.
    async fn submit(&self, request: &RequestEnvelope) -> Result<SubmitResponse, TransportError>;

    /// Retrieves the state of a previously deferred request.
    ///
    /// # Errors
    /// Returns a `TransportError` if no protocol-level answer was obtained.
    async fn retrieve(&self, request_id: &RequestId) -> Result<RetrieveResponse, TransportError>;
}
