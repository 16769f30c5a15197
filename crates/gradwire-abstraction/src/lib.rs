//! Core types for the gradwire training client.
//!
//! This crate defines the data model exchanged with a remote training service
//! (tensors, datums, operation outputs), the request/response envelopes of the
//! submit/retrieve protocol, the error types shared by every client component,
//! and the `Transport` trait that concrete network bindings implement.

pub mod envelope;
pub mod error;
pub mod tensor;
pub mod transport;
pub mod types;

pub use envelope::{
    OperationKind, QueueState, RequestEnvelope, RequestId, RetrieveResponse, ServerError,
    SubmitResponse, TryAgain,
};
pub use error::{ClientError, ClientResult, TransportError};
pub use tensor::{DType, TensorData};
pub use transport::Transport;
pub use types::{
    AdamParams, Datum, ForwardBackwardInput, ForwardBackwardOutput, ForwardOutput, LossFnOutput,
    LossKind, Metrics, ModelInput, ModelInputChunk, OptimStepOutput,
};
