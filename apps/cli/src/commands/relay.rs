//! Relay command: custom-loss training with built-in losses.

use super::types::RelayLossArg;
use super::{connect, poll_options, print_json};
use crate::config::require_model_id;
use crate::data::load_jsonl;
use anyhow::{Context, Result};
use gradwire_abstraction::{Datum, Metrics};
use gradwire_client::{scalar_value, ClientConfig, LossError, Tensor, TrackedTensor};
use std::path::Path;
use tracing::info;

/// Execute the relay command.
///
/// A wait abandoned halfway through is logged by the relay with the request
/// id of the step that was still running.
pub async fn execute(
    config: &ClientConfig,
    data_path: &Path,
    loss: RelayLossArg,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let data = load_jsonl(data_path)?;
    let training = connect(config)?.training_client(require_model_id(config)?);

    info!(data = data.len(), loss = ?loss, "Running custom-loss training step");
    let output = training
        .forward_backward_custom(&data, &poll_options(timeout_secs), move |data, logprobs| {
            builtin_loss(loss, data, logprobs)
        })
        .await
        .context("Custom-loss training step failed")?;
    print_json(&output)
}

/// Negative log-likelihood over every token, summed or averaged.
pub fn builtin_loss(
    loss: RelayLossArg,
    _data: &[Datum],
    logprobs: &[TrackedTensor],
) -> Result<(Tensor, Metrics), LossError> {
    if logprobs.is_empty() {
        return Err(LossError::from("no data"));
    }
    let tokens: usize = logprobs.iter().map(TrackedTensor::len).sum();
    if tokens == 0 {
        return Err(LossError::from("no tokens to score"));
    }

    let mut total: Option<Tensor> = None;
    for tensor in logprobs.iter().filter(|tensor| !tensor.is_empty()) {
        let sum = tensor.sum()?;
        total = Some(match total {
            Some(acc) => acc.add(&sum)?,
            None => sum,
        });
    }
    let total = total.ok_or_else(|| LossError::from("no tokens to score"))?;

    let value = match loss {
        RelayLossArg::Sum => total.neg()?,
        RelayLossArg::Mean => total.affine(-1.0 / tokens as f64, 0.0)?,
    };

    let mut metrics = Metrics::new();
    metrics.insert("custom_loss".to_string(), scalar_value(&value)?);
    metrics.insert("custom_loss_tokens".to_string(), tokens as f64);
    Ok((value, metrics))
}
