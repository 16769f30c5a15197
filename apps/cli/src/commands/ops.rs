//! Single-operation commands.

use super::types::OpArg;
use super::{connect, poll_options, print_json};
use crate::config::require_model_id;
use crate::data::load_jsonl;
use anyhow::{Context, Result};
use gradwire_abstraction::{AdamParams, ClientError, LossKind, OperationKind, RequestId};
use gradwire_client::{ApiFuture, ClientConfig, FutureController};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use tracing::info;

/// Execute the forward command.
pub async fn forward(
    config: &ClientConfig,
    data_path: &Path,
    loss_fn: LossKind,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let data = load_jsonl(data_path)?;
    let training = connect(config)?.training_client(require_model_id(config)?);

    info!(data = data.len(), loss_fn = %loss_fn, "Running forward pass");
    let future = training.submit_forward(&data, loss_fn).await.context("Forward pass failed")?;
    let output = wait(training.controller(), future, timeout_secs)
        .await
        .context("Forward pass failed")?;
    print_json(&output)
}

/// Execute the forward-backward command.
pub async fn forward_backward(
    config: &ClientConfig,
    data_path: &Path,
    loss_fn: LossKind,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let data = load_jsonl(data_path)?;
    let training = connect(config)?.training_client(require_model_id(config)?);

    info!(data = data.len(), loss_fn = %loss_fn, "Running forward-backward pass");
    let future = training
        .submit_forward_backward(&data, loss_fn)
        .await
        .context("Forward-backward pass failed")?;
    let output = wait(training.controller(), future, timeout_secs)
        .await
        .context("Forward-backward pass failed")?;
    print_json(&output)
}

/// Adam parameters from the command line, defaults for the rest.
pub fn adam_params(
    learning_rate: f64,
    beta1: Option<f64>,
    beta2: Option<f64>,
    eps: Option<f64>,
) -> AdamParams {
    let defaults = AdamParams::default();
    AdamParams {
        learning_rate,
        beta1: beta1.unwrap_or(defaults.beta1),
        beta2: beta2.unwrap_or(defaults.beta2),
        eps: eps.unwrap_or(defaults.eps),
    }
}

/// Execute the optim-step command.
pub async fn optim_step(
    config: &ClientConfig,
    params: AdamParams,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let training = connect(config)?.training_client(require_model_id(config)?);

    info!(learning_rate = params.learning_rate, "Running optimizer step");
    let future = training.submit_optim_step(params).await.context("Optimizer step failed")?;
    let output = wait(training.controller(), future, timeout_secs)
        .await
        .context("Optimizer step failed")?;
    print_json(&output)
}

/// Execute the retrieve command.
pub async fn retrieve(
    config: &ClientConfig,
    request_id: String,
    op: OperationKind,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let client = connect(config)?;
    let future = client.controller().attach::<Value>(op, RequestId::from(request_id));

    let output = wait(client.controller(), future, timeout_secs)
        .await
        .with_context(|| format!("Retrieving {} result failed", op))?;
    print_json(&output)
}

/// Polls a future to completion, naming its request in errors that leave it running.
async fn wait<T: DeserializeOwned + Clone>(
    controller: &FutureController,
    mut future: ApiFuture<T>,
    timeout_secs: Option<u64>,
) -> Result<T> {
    match controller.poll(&mut future, &poll_options(timeout_secs)).await {
        Ok(output) => Ok(output),
        Err(error) => Err(with_hint(error, future.op(), future.request_id())),
    }
}

/// Adds what to do next to errors that leave the request running.
pub fn with_hint(
    error: ClientError,
    op: OperationKind,
    request_id: Option<&RequestId>,
) -> anyhow::Error {
    let abandoned = matches!(error, ClientError::TimeoutExceeded { .. } | ClientError::Cancelled);
    let error = anyhow::Error::new(error);
    match (abandoned, request_id) {
        (false, _) => error,
        (true, Some(request_id)) => error.context(format!(
            "Request {request_id} may still complete; wait for it with \
             `gradwire retrieve --request-id {request_id} --op {}`",
            OpArg::from(op).flag()
        )),
        (true, None) => {
            error.context("The server never admitted the request; run the command again")
        }
    }
}
