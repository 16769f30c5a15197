//! Per-model training handle.

use crate::autodiff::{LossError, TrackedTensor};
use crate::controller::FutureController;
use crate::future::{ApiFuture, PollOptions};
use crate::relay::GradientRelay;
use candle_core::Tensor;
use gradwire_abstraction::{
    AdamParams, ClientError, ClientResult, Datum, ForwardBackwardOutput, ForwardOutput, LossKind,
    Metrics, OperationKind, OptimStepOutput,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Serialize)]
struct ForwardInputBody<'a> {
    data: &'a [Datum],
    loss_fn: LossKind,
}

#[derive(Serialize)]
struct ForwardBody<'a> {
    model_id: &'a str,
    seq_id: u64,
    forward_input: ForwardInputBody<'a>,
}

#[derive(Serialize)]
struct OptimStepBody<'a> {
    model_id: &'a str,
    seq_id: u64,
    adam_params: AdamParams,
}

/// Submits operations for one model.
///
/// Every request carries a `seq_id` taken from a per-handle counter, so the
/// server can tell the order in which one caller issued its operations.
#[derive(Debug)]
pub struct TrainingClient {
    controller: Arc<FutureController>,
    model_id: String,
    next_seq_id: AtomicU64,
}

impl TrainingClient {
    /// Creates a handle for `model_id`.
    pub fn new(controller: Arc<FutureController>, model_id: impl Into<String>) -> Self {
        Self { controller, model_id: model_id.into(), next_seq_id: AtomicU64::new(0) }
    }

    /// The model this handle trains.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The controller driving this handle's futures.
    pub fn controller(&self) -> &Arc<FutureController> {
        &self.controller
    }

    fn take_seq_id(&self) -> u64 {
        self.next_seq_id.fetch_add(1, Ordering::SeqCst)
    }

    fn forward_body(&self, data: &[Datum], loss_fn: LossKind) -> ClientResult<serde_json::Value> {
        validate_data(data)?;
        let body = ForwardBody {
            model_id: &self.model_id,
            seq_id: self.take_seq_id(),
            forward_input: ForwardInputBody { data, loss_fn },
        };
        Ok(serde_json::to_value(&body)?)
    }

    /// Submits a forward pass.
    ///
    /// # Errors
    /// Returns `Serialization` if a datum holds an inconsistent tensor.
    pub async fn submit_forward(
        &self,
        data: &[Datum],
        loss_fn: LossKind,
    ) -> ClientResult<ApiFuture<ForwardOutput>> {
        let body = self.forward_body(data, loss_fn)?;
        debug!(
            model_id = %self.model_id,
            data = data.len(),
            loss_fn = %loss_fn,
            "Submitting forward"
        );
        Ok(self.controller.submit(OperationKind::Forward, body).await)
    }

    /// Submits a forward-backward pass.
    ///
    /// # Errors
    /// Returns `Serialization` if a datum holds an inconsistent tensor.
    pub async fn submit_forward_backward(
        &self,
        data: &[Datum],
        loss_fn: LossKind,
    ) -> ClientResult<ApiFuture<ForwardBackwardOutput>> {
        let body = self.forward_body(data, loss_fn)?;
        debug!(
            model_id = %self.model_id,
            data = data.len(),
            loss_fn = %loss_fn,
            "Submitting forward_backward"
        );
        Ok(self.controller.submit(OperationKind::ForwardBackward, body).await)
    }

    /// Submits an optimizer step.
    ///
    /// # Errors
    /// Returns `Serialization` if the body cannot be encoded.
    pub async fn submit_optim_step(
        &self,
        adam_params: AdamParams,
    ) -> ClientResult<ApiFuture<OptimStepOutput>> {
        let body = OptimStepBody {
            model_id: &self.model_id,
            seq_id: self.take_seq_id(),
            adam_params,
        };
        let body = serde_json::to_value(&body)?;
        debug!(
            model_id = %self.model_id,
            learning_rate = adam_params.learning_rate,
            "Submitting optim_step"
        );
        Ok(self.controller.submit(OperationKind::OptimStep, body).await)
    }

    /// Runs a forward pass to completion.
    ///
    /// # Errors
    /// Any submission or polling failure.
    pub async fn forward(
        &self,
        data: &[Datum],
        loss_fn: LossKind,
        options: &PollOptions,
    ) -> ClientResult<ForwardOutput> {
        let mut future = self.submit_forward(data, loss_fn).await?;
        self.controller.poll(&mut future, options).await
    }

    /// Runs a forward-backward pass to completion.
    ///
    /// # Errors
    /// Any submission or polling failure.
    pub async fn forward_backward(
        &self,
        data: &[Datum],
        loss_fn: LossKind,
        options: &PollOptions,
    ) -> ClientResult<ForwardBackwardOutput> {
        let mut future = self.submit_forward_backward(data, loss_fn).await?;
        self.controller.poll(&mut future, options).await
    }

    /// Runs an optimizer step to completion.
    ///
    /// # Errors
    /// Any submission or polling failure.
    pub async fn optim_step(
        &self,
        adam_params: AdamParams,
        options: &PollOptions,
    ) -> ClientResult<OptimStepOutput> {
        let mut future = self.submit_optim_step(adam_params).await?;
        self.controller.poll(&mut future, options).await
    }

    /// Runs a forward-backward pass with a locally differentiated loss.
    ///
    /// See [`GradientRelay::run`].
    ///
    /// # Errors
    /// Any failure of the relay; on error the model has not been updated.
    pub async fn forward_backward_custom<F>(
        &self,
        data: &[Datum],
        options: &PollOptions,
        loss_fn: F,
    ) -> ClientResult<ForwardBackwardOutput>
    where
        F: FnOnce(&[Datum], &[TrackedTensor]) -> Result<(Tensor, Metrics), LossError> + Send,
    {
        GradientRelay::new(self, options.clone()).run(data, loss_fn).await
    }
}

fn validate_data(data: &[Datum]) -> ClientResult<()> {
    for (index, datum) in data.iter().enumerate() {
        for (key, tensor) in &datum.loss_fn_inputs {
            tensor.validate().map_err(|e| {
                ClientError::Serialization(format!("datum {} loss input {}: {}", index, key, e))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;
    use crate::observer::QueueStateObserver;
    use gradwire_abstraction::{ModelInput, RequestEnvelope, TensorData};

    fn client(transport: Arc<ScriptedTransport>) -> TrainingClient {
        let controller = FutureController::new(transport, Arc::new(QueueStateObserver::noop()));
        TrainingClient::new(Arc::new(controller), "model-1")
    }

    fn datum() -> Datum {
        Datum::new(ModelInput::from_ints(vec![1, 2]), TensorData::ints(&[2, 3]))
    }

    #[tokio::test]
    async fn test_forward_body_layout() {
        let transport = Arc::new(ScriptedTransport::new());
        let training = client(transport.clone());

        training.submit_forward(&[datum()], LossKind::CrossEntropy).await.unwrap();

        let submitted: Vec<RequestEnvelope> = transport.submitted();
        let body = &submitted[0].body;
        assert_eq!(submitted[0].op, OperationKind::Forward);
        assert_eq!(body["model_id"], "model-1");
        assert_eq!(body["seq_id"], 0);
        assert_eq!(body["forward_input"]["loss_fn"], "cross_entropy");
        let first = &body["forward_input"]["data"][0];
        assert_eq!(first["loss_fn_inputs"]["target_tokens"]["data"][1], 3);
        assert_eq!(submitted[0].forward_input().unwrap().data, vec![datum()]);
    }

    #[tokio::test]
    async fn test_seq_ids_increase_across_operations() {
        let transport = Arc::new(ScriptedTransport::new());
        let training = client(transport.clone());

        training.submit_forward(&[datum()], LossKind::CrossEntropy).await.unwrap();
        training.submit_forward_backward(&[datum()], LossKind::CrossEntropy).await.unwrap();
        training.submit_optim_step(AdamParams::default()).await.unwrap();

        let seq_ids: Vec<u64> =
            transport.submitted().iter().filter_map(RequestEnvelope::seq_id).collect();
        assert_eq!(seq_ids, vec![0, 1, 2]);
        assert_eq!(transport.submitted()[2].body["adam_params"]["beta2"], 0.95);
    }

    #[tokio::test]
    async fn test_inconsistent_tensor_is_rejected_before_submit() {
        let transport = Arc::new(ScriptedTransport::new());
        let training = client(transport.clone());
        let weights = TensorData::floats(vec![1.0]).with_shape(vec![2]);
        let bad = datum().with_loss_fn_input(Datum::WEIGHTS, weights);

        let error = training.submit_forward(&[bad], LossKind::CrossEntropy).await.unwrap_err();
        assert_eq!(error.tag(), "serialization_error");
        assert_eq!(transport.submit_count(), 0);
    }
}
