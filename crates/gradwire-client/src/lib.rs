//! Client runtime for a remote training service.
//!
//! Operations are submitted as asynchronous requests and resolved through
//! [`FutureController::poll`], which follows the server's submit/retrieve
//! protocol: it waits out `TryAgain` backpressure, retries transport
//! failures with exponential backoff, and honours deadlines and
//! cancellation. [`TrainingClient`] builds operation bodies for one model;
//! [`GradientRelay`] trains with a loss differentiated locally with candle
//! (see [`autodiff`]).
//!
//! ```no_run
//! use gradwire_client::{ClientConfig, PollOptions, ServiceClient};
//! use gradwire_abstraction::{Datum, LossKind, ModelInput, TensorData};
//!
//! # async fn run() -> gradwire_abstraction::ClientResult<()> {
//! let config = ClientConfig::default().with_base_url("http://localhost:8000");
//! let client = ServiceClient::from_config(&config)?;
//! let training = client.training_client("my-model");
//!
//! let data = vec![Datum::new(ModelInput::from_ints(vec![1, 2]), TensorData::ints(&[2, 3]))];
//! let output = training
//!     .forward_backward_custom(&data, &PollOptions::default(), |_data, logprobs| {
//!         let loss = logprobs[0].sum()?.neg()?;
//!         Ok((loss, Default::default()))
//!     })
//!     .await?;
//! println!("{:?}", output.metrics);
//! # Ok(())
//! # }
//! ```

pub mod autodiff;
pub mod client;
pub mod config;
pub mod controller;
pub mod future;
pub mod http;
pub mod mock;
pub mod observer;
pub mod relay;
pub mod retry;
pub mod training;

pub use autodiff::{
    differentiate, scalar_value, Differentiated, DifferentiationError, LossError, TrackedTensor,
};
pub use candle_core;
pub use candle_core::Tensor;
pub use client::ServiceClient;
pub use config::{BackpressureConfig, ClientConfig, ConfigError, ConfigResult, RetryConfig};
pub use controller::FutureController;
pub use future::{ApiFuture, FutureId, FutureStatus, PollOptions};
pub use http::HttpTransport;
pub use mock::{ScriptedTransport, TransportCall};
pub use observer::{
    NoopSink, QueueStateNotification, QueueStateObserver, QueueStateSink, TracingSink,
    DEFAULT_DEBOUNCE_WINDOW,
};
pub use relay::{GradientRelay, LOGPROBS_KEY};
pub use retry::{BackpressurePolicy, RetryPolicy};
pub use training::TrainingClient;
