//! Training with a locally differentiated loss.
//!
//! The server only knows its built-in losses, but a weighted cross entropy
//! `L = -Σ w·logprob` has `dL/dlogprob = -w`. A relay therefore:
//!
//! 1. runs a forward pass to obtain per-token logprobs,
//! 2. differentiates the caller's loss with respect to those logprobs locally,
//! 3. submits a forward-backward pass whose weights are the negated gradients,
//!    so the server back-propagates exactly `dLoss/dlogprob` into the model.
//!
//! Nothing mutates server state until every local step has succeeded.

use crate::autodiff::{differentiate, Differentiated, LossError, TrackedTensor};
use crate::future::{ApiFuture, PollOptions};
use crate::training::TrainingClient;
use candle_core::Tensor;
use gradwire_abstraction::{
    ClientError, ClientResult, Datum, ForwardBackwardOutput, ForwardOutput, LossKind, Metrics,
    TensorData,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

/// Key of the per-token log probabilities in a forward output.
pub const LOGPROBS_KEY: &str = "logprobs";

/// Runs custom-loss training steps for one training client.
#[derive(Debug)]
pub struct GradientRelay<'a> {
    training: &'a TrainingClient,
    options: PollOptions,
}

impl<'a> GradientRelay<'a> {
    /// Creates a relay; `options` apply to each of its two RPCs.
    pub fn new(training: &'a TrainingClient, options: PollOptions) -> Self {
        Self { training, options }
    }

    /// Trains one step on `data` with `loss_fn`.
    ///
    /// `loss_fn` receives the data and one tracked tensor of logprobs per
    /// datum (same order, same shape) and returns the scalar loss and any
    /// metrics to report. Its metrics override server metrics of the same name.
    ///
    /// # Errors
    /// Fails without issuing the forward-backward call if the forward pass
    /// fails, its outputs do not line up with `data`, or the loss cannot be
    /// differentiated.
    pub async fn run<F>(&self, data: &[Datum], loss_fn: F) -> ClientResult<ForwardBackwardOutput>
    where
        F: FnOnce(&[Datum], &[TrackedTensor]) -> Result<(Tensor, Metrics), LossError> + Send,
    {
        let future = self.training.submit_forward(data, LossKind::CrossEntropy).await?;
        let forward = self.await_step(future).await?;
        let logprobs = extract_logprobs(data, &forward)?;

        let differentiated = compute_gradients(data, &logprobs, loss_fn)?;
        info!(
            model_id = self.training.model_id(),
            data = data.len(),
            loss = differentiated.loss,
            "Computed custom loss gradients"
        );

        let synthetic = build_synthetic_data(data, &logprobs, &differentiated.gradients);
        let future = self
            .training
            .submit_forward_backward(&synthetic, LossKind::CrossEntropy)
            .await?;
        let mut output = self.await_step(future).await?;

        merge_metrics(&mut output.metrics, differentiated.aux);
        Ok(output)
    }

    async fn await_step<T: DeserializeOwned + Clone>(
        &self,
        mut future: ApiFuture<T>,
    ) -> ClientResult<T> {
        let result = self.training.controller().poll(&mut future, &self.options).await;
        let abandoned =
            matches!(result, Err(ClientError::TimeoutExceeded { .. } | ClientError::Cancelled));
        if let (true, Some(request_id)) = (abandoned, future.request_id()) {
            warn!(
                op = %future.op(),
                request_id = %request_id,
                "Stopped waiting for a relay step; the request keeps running on the server"
            );
        }
        result
    }
}

/// Pulls one logprobs tensor per datum out of a forward output.
///
/// # Errors
/// Returns `ShapeMismatch` if the output count differs from the data count
/// or a datum's logprobs differ in length from its target tokens, and
/// `Serialization` if an output has no logprobs.
pub fn extract_logprobs(data: &[Datum], output: &ForwardOutput) -> ClientResult<Vec<TensorData>> {
    if output.loss_fn_outputs.len() != data.len() {
        return Err(ClientError::ShapeMismatch {
            context: "forward loss_fn_outputs".to_string(),
            expected: data.len(),
            actual: output.loss_fn_outputs.len(),
        });
    }

    data.iter()
        .zip(&output.loss_fn_outputs)
        .enumerate()
        .map(|(index, (datum, outputs))| {
            let logprobs = outputs.get(LOGPROBS_KEY).ok_or_else(|| {
                let message = format!("forward output {} has no {}", index, LOGPROBS_KEY);
                ClientError::Serialization(message)
            })?;
            let expected = datum.target_tokens().map_or(0, TensorData::numel);
            if logprobs.numel() != expected {
                return Err(ClientError::ShapeMismatch {
                    context: format!("logprobs of datum {}", index),
                    expected,
                    actual: logprobs.numel(),
                });
            }
            Ok(logprobs.clone())
        })
        .collect()
}

/// Differentiates `loss_fn` with respect to every logprob.
///
/// # Errors
/// Returns `GradientComputation` if the loss function fails, the loss or a
/// gradient is not finite, or the loss ignores some datum.
pub fn compute_gradients<F>(
    data: &[Datum],
    logprobs: &[TensorData],
    loss_fn: F,
) -> ClientResult<Differentiated<Metrics>>
where
    F: FnOnce(&[Datum], &[TrackedTensor]) -> Result<(Tensor, Metrics), LossError>,
{
    let differentiated = differentiate(logprobs, |tracked| loss_fn(data, tracked))
        .map_err(|e| ClientError::GradientComputation(e.to_string()))?;
    debug!(loss = differentiated.loss, inputs = logprobs.len(), "Backward pass complete");
    Ok(differentiated)
}

/// Converts `dLoss/dlogprob` into cross-entropy weights.
///
/// Cross entropy is `-Σ w·logprob`, so weights equal to the negated gradient
/// make the server's gradient equal the local one.
pub fn descent_weights(gradient: &[f64]) -> Vec<f64> {
    gradient.iter().map(|g| -g).collect()
}

/// A copy of `datum` keeping its model input and targets, weighted by the
/// descent weights of `gradient` in the shape of `logprobs`.
pub fn synthetic_datum(datum: &Datum, logprobs: &TensorData, gradient: &[f64]) -> Datum {
    let mut synthetic = datum.clone();
    synthetic.loss_fn_inputs.retain(|key, _| key == Datum::TARGET_TOKENS);
    let weights =
        TensorData::floats(descent_weights(gradient)).with_shape(logprobs.effective_shape());
    synthetic.with_loss_fn_input(Datum::WEIGHTS, weights)
}

/// Builds the forward-backward data of a relay step, one datum per input.
pub fn build_synthetic_data(
    data: &[Datum],
    logprobs: &[TensorData],
    gradients: &[Vec<f64>],
) -> Vec<Datum> {
    data.iter()
        .zip(logprobs)
        .zip(gradients)
        .map(|((datum, logprobs), gradient)| synthetic_datum(datum, logprobs, gradient))
        .collect()
}

/// Merges loss-function metrics into server metrics; local values win.
pub fn merge_metrics(server: &mut Metrics, local: Metrics) {
    server.extend(local);
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradwire_abstraction::ModelInput;
    use std::collections::HashMap;

    fn datum(tokens: &[i64]) -> Datum {
        Datum::new(ModelInput::from_ints(tokens.to_vec()), TensorData::ints(tokens))
    }

    fn output_with(logprobs: Vec<Vec<f64>>) -> ForwardOutput {
        ForwardOutput {
            loss_fn_outputs: logprobs
                .into_iter()
                .map(|values| {
                    HashMap::from([(LOGPROBS_KEY.to_string(), TensorData::floats(values))])
                })
                .collect(),
            ..ForwardOutput::default()
        }
    }

    #[test]
    fn test_extract_logprobs_keeps_per_datum_lengths() {
        let data = vec![datum(&[1, 2]), datum(&[3, 4, 5])];
        let output = output_with(vec![vec![-0.1, -0.2], vec![-0.3, -0.4, -0.5]]);

        let logprobs = extract_logprobs(&data, &output).unwrap();
        assert_eq!(logprobs.len(), 2);
        assert_eq!(logprobs[0].numel(), 2);
        assert_eq!(logprobs[1].numel(), 3);
    }

    #[test]
    fn test_extract_logprobs_rejects_count_mismatch() {
        let data = vec![datum(&[1]), datum(&[2])];
        let output = output_with(vec![vec![-0.1]]);

        let error = extract_logprobs(&data, &output).unwrap_err();
        assert!(matches!(error, ClientError::ShapeMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_extract_logprobs_rejects_length_mismatch() {
        let data = vec![datum(&[1, 2, 3])];
        let output = output_with(vec![vec![-0.1, -0.2]]);

        let error = extract_logprobs(&data, &output).unwrap_err();
        assert!(matches!(error, ClientError::ShapeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn test_descent_weights_negate_gradient() {
        assert_eq!(descent_weights(&[1.0, -0.5, 0.0]), vec![-1.0, 0.5, -0.0]);
    }

    #[test]
    fn test_synthetic_datum_only_replaces_weights() {
        let original = datum(&[5, 6])
            .with_loss_fn_input(Datum::WEIGHTS, TensorData::floats(vec![9.0, 9.0]))
            .with_loss_fn_input("advantages", TensorData::floats(vec![1.0, 1.0]));
        let logprobs = TensorData::floats(vec![-0.1, -0.2]);

        let synthetic = synthetic_datum(&original, &logprobs, &[0.5, 1.0]);
        assert_eq!(synthetic.model_input, original.model_input);
        assert_eq!(synthetic.target_tokens(), original.target_tokens());
        assert_eq!(synthetic.weights().unwrap().data, vec![-0.5, -1.0]);
        assert_eq!(synthetic.weights().unwrap().effective_shape(), vec![2]);
        assert!(!synthetic.loss_fn_inputs.contains_key("advantages"));
    }

    #[test]
    fn test_compute_gradients_wraps_loss_errors() {
        let data = vec![datum(&[1])];
        let logprobs = vec![TensorData::floats(vec![-0.1])];

        let error = compute_gradients(&data, &logprobs, |_, _| Err(LossError::from("boom")))
            .unwrap_err();
        assert_eq!(error.tag(), "gradient_computation_error");
    }

    #[test]
    fn test_merge_metrics_prefers_local_values() {
        let mut server =
            HashMap::from([("loss:sum".to_string(), 1.0), ("tokens".to_string(), 5.0)]);
        merge_metrics(&mut server, HashMap::from([("loss:sum".to_string(), 2.0)]));
        assert_eq!(server["loss:sum"], 2.0);
        assert_eq!(server["tokens"], 5.0);
    }
}
