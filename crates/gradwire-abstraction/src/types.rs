//! Training data and operation payloads.

use crate::tensor::TensorData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Scalar metrics reported by the server or by a local loss function.
pub type Metrics = HashMap<String, f64>;

/// Per-datum outputs of a loss function, keyed by output name (e.g. "logprobs").
pub type LossFnOutput = HashMap<String, TensorData>;

/// One chunk of model input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelInputChunk {
    /// Already-tokenized text.
    EncodedText {
        /// Token ids.
        tokens: Vec<i64>,
    },
}

impl ModelInputChunk {
    /// Number of tokens in this chunk.
    pub fn length(&self) -> usize {
        match self {
            Self::EncodedText { tokens } => tokens.len(),
        }
    }
}

/// Ordered model input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInput {
    /// Input chunks, concatenated in order.
    pub chunks: Vec<ModelInputChunk>,
}

impl ModelInput {
    /// Creates a single-chunk input from token ids.
    #[must_use]
    pub fn from_ints(tokens: Vec<i64>) -> Self {
        Self { chunks: vec![ModelInputChunk::EncodedText { tokens }] }
    }

    /// Total number of tokens.
    pub fn length(&self) -> usize {
        self.chunks.iter().map(ModelInputChunk::length).sum()
    }

    /// All token ids, concatenated.
    pub fn to_ints(&self) -> Vec<i64> {
        self.chunks
            .iter()
            .flat_map(|chunk| match chunk {
                ModelInputChunk::EncodedText { tokens } => tokens.iter().copied(),
            })
            .collect()
    }
}

/// One training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Tokens fed to the model.
    pub model_input: ModelInput,
    /// Inputs to the loss function; always contains `target_tokens`.
    pub loss_fn_inputs: HashMap<String, TensorData>,
}

impl Datum {
    /// Key of the target token tensor.
    pub const TARGET_TOKENS: &'static str = "target_tokens";
    /// Key of the per-token weight tensor.
    pub const WEIGHTS: &'static str = "weights";

    /// Creates a datum with the given targets and no other loss inputs.
    #[must_use]
    pub fn new(model_input: ModelInput, target_tokens: TensorData) -> Self {
        let mut loss_fn_inputs = HashMap::new();
        loss_fn_inputs.insert(Self::TARGET_TOKENS.to_string(), target_tokens);
        Self { model_input, loss_fn_inputs }
    }

    /// Adds or replaces a loss input.
    #[must_use]
    pub fn with_loss_fn_input(mut self, key: impl Into<String>, tensor: TensorData) -> Self {
        self.loss_fn_inputs.insert(key.into(), tensor);
        self
    }

    /// The target tokens, if present.
    pub fn target_tokens(&self) -> Option<&TensorData> {
        self.loss_fn_inputs.get(Self::TARGET_TOKENS)
    }

    /// The per-token weights, if present.
    pub fn weights(&self) -> Option<&TensorData> {
        self.loss_fn_inputs.get(Self::WEIGHTS)
    }
}

/// Built-in server-side loss functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// (Optionally weighted) token-level cross entropy.
    CrossEntropy,
    /// Importance-sampled policy gradient.
    ImportanceSampling,
    /// Clipped PPO objective.
    Ppo,
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CrossEntropy => "cross_entropy",
            Self::ImportanceSampling => "importance_sampling",
            Self::Ppo => "ppo",
        };
        f.write_str(name)
    }
}

/// Input of forward and forward-backward operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardBackwardInput {
    /// Examples to evaluate.
    pub data: Vec<Datum>,
    /// Loss function to evaluate them with.
    pub loss_fn: LossKind,
}

/// Output of forward and forward-backward operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardBackwardOutput {
    /// Name of the output structure (e.g. "TorchLossReturn").
    #[serde(default)]
    pub loss_fn_output_type: String,
    /// One entry per input datum, in input order.
    #[serde(default)]
    pub loss_fn_outputs: Vec<LossFnOutput>,
    /// Aggregate metrics.
    #[serde(default)]
    pub metrics: Metrics,
}

/// A forward pass returns the same structure as a forward-backward pass.
pub type ForwardOutput = ForwardBackwardOutput;

/// Adam optimizer hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    /// Step size.
    pub learning_rate: f64,
    /// First moment decay.
    pub beta1: f64,
    /// Second moment decay.
    pub beta2: f64,
    /// Numerical stability term.
    pub eps: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self { learning_rate: 1e-4, beta1: 0.9, beta2: 0.95, eps: 1e-12 }
    }
}

/// Output of an optimizer step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimStepOutput {
    /// Optional optimizer metrics.
    #[serde(default)]
    pub metrics: Option<Metrics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_input_serialization() {
        let input = ModelInput::from_ints(vec![1, 2, 3]);
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value, json!({"chunks": [{"type": "encoded_text", "tokens": [1, 2, 3]}]}));
        assert_eq!(input.length(), 3);
        assert_eq!(input.to_ints(), vec![1, 2, 3]);
    }

    #[test]
    fn test_datum_accessors() {
        let datum = Datum::new(ModelInput::from_ints(vec![7, 8]), TensorData::ints(&[8, 9]))
            .with_loss_fn_input(Datum::WEIGHTS, TensorData::floats(vec![1.0, 0.5]));
        assert_eq!(datum.target_tokens().unwrap().to_ints(), vec![8, 9]);
        assert_eq!(datum.weights().unwrap().data, vec![1.0, 0.5]);
    }

    #[test]
    fn test_forward_backward_output_keeps_per_datum_entries() {
        let output: ForwardBackwardOutput = serde_json::from_value(json!({
            "loss_fn_output_type": "TorchLossReturn",
            "loss_fn_outputs": [
                {"logprobs": {"data": [-0.1, -0.2], "dtype": "float32"}},
                {"logprobs": {"data": [-0.3, -0.4, -0.5], "dtype": "float32"}}
            ],
            "metrics": {"loss:sum": 1.5}
        }))
        .unwrap();
        assert_eq!(output.loss_fn_outputs.len(), 2);
        assert_eq!(output.loss_fn_outputs[1]["logprobs"].numel(), 3);
        assert_eq!(output.metrics["loss:sum"], 1.5);
    }

    #[test]
    fn test_loss_kind_wire_names() {
        assert_eq!(serde_json::to_value(LossKind::CrossEntropy).unwrap(), json!("cross_entropy"));
        assert_eq!(LossKind::ImportanceSampling.to_string(), "importance_sampling");
    }
}
