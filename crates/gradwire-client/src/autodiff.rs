//! Local differentiation of a loss over wire tensors, backed by candle.
//!
//! Every input becomes a candle [`Var`] leaf. The loss function builds a
//! scalar [`Tensor`] from those leaves with ordinary candle operations, and
//! `backward()` yields `dLoss/dInput` for every leaf from the gradient store.

use candle_core::{DType, Device, Tensor, Var};
use gradwire_abstraction::TensorData;
use thiserror::Error;

/// Error raised by a user loss function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LossError(String);

impl LossError {
    /// Creates a loss error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for LossError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for LossError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<candle_core::Error> for LossError {
    fn from(error: candle_core::Error) -> Self {
        Self(error.to_string())
    }
}

/// Why a gradient could not be computed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DifferentiationError {
    /// The loss function returned an error.
    #[error("Loss function failed: {0}")]
    Loss(#[from] LossError),

    /// A tensor operation failed while recording inputs or back-propagating.
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    /// The loss holds more than one value.
    #[error("Loss must be a scalar, got shape {0:?}")]
    NotScalar(Vec<usize>),

    /// The loss value is NaN or infinite.
    #[error("Loss is not finite: {0}")]
    NonFiniteLoss(f64),

    /// A gradient entry is NaN or infinite.
    #[error("Gradient of input {input} at position {position} is not finite")]
    NonFiniteGradient { input: usize, position: usize },

    /// The loss does not depend on a non-empty input, so its gradient is undefined.
    #[error("Loss does not depend on input {input}")]
    Disconnected { input: usize },
}

impl From<candle_core::Error> for DifferentiationError {
    fn from(error: candle_core::Error) -> Self {
        Self::Tensor(error.to_string())
    }
}

/// A differentiable input of a loss function.
#[derive(Debug, Clone)]
pub struct TrackedTensor {
    var: Var,
}

impl TrackedTensor {
    /// Records `data` as a leaf in `f64`, in its effective shape.
    ///
    /// # Errors
    /// Fails if the declared shape does not cover the data.
    pub fn leaf(data: &TensorData) -> Result<Self, DifferentiationError> {
        let var = Var::from_vec(data.data.clone(), data.effective_shape(), &Device::Cpu)?;
        Ok(Self { var })
    }

    /// The underlying tensor, for composing candle operations.
    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.var.elem_count()
    }

    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimensions of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.var.dims()
    }

    /// Forward values in row-major order.
    pub fn values(&self) -> Result<Vec<f64>, LossError> {
        Ok(self.var.flatten_all()?.to_vec1::<f64>()?)
    }

    /// Element at a flat index, still connected to the leaf.
    pub fn get(&self, index: usize) -> Result<Tensor, LossError> {
        Ok(self.var.flatten_all()?.get(index)?)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> Result<Tensor, LossError> {
        Ok(self.var.sum_all()?)
    }

    /// Mean of all elements; NaN for an empty tensor.
    pub fn mean(&self) -> Result<Tensor, LossError> {
        Ok(self.var.mean_all()?)
    }

    /// Weighted sum `Σ w_i x_i` over the flattened elements.
    ///
    /// # Errors
    /// Returns a `LossError` if `weights` has a different length than the tensor.
    pub fn dot(&self, weights: &[f64]) -> Result<Tensor, LossError> {
        if weights.len() != self.len() {
            return Err(LossError::new(format!(
                "dot product of {} elements with {} weights",
                self.len(),
                weights.len()
            )));
        }
        let weights = Tensor::from_slice(weights, weights.len(), &Device::Cpu)?;
        Ok(self.var.flatten_all()?.mul(&weights)?.sum_all()?)
    }
}

/// Reads a single-element tensor as `f64`.
///
/// # Errors
/// Fails if the tensor does not hold exactly one element.
pub fn scalar_value(tensor: &Tensor) -> Result<f64, LossError> {
    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    match values.as_slice() {
        [value] => Ok(*value),
        _ => Err(LossError::new(format!("expected one value, got {}", values.len()))),
    }
}

/// Result of [`differentiate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Differentiated<A> {
    /// Forward value of the loss.
    pub loss: f64,
    /// `dLoss/dInput` for every input, flattened in row-major order.
    pub gradients: Vec<Vec<f64>>,
    /// Extra output of the loss function.
    pub aux: A,
}

/// Records `inputs` as leaves, evaluates `f` and returns the gradient of its
/// loss with respect to every input element.
///
/// # Errors
/// Fails if `f` fails, if the loss is not a finite scalar, if a gradient is
/// not finite, or if the loss does not depend on some non-empty input.
pub fn differentiate<A, F>(
    inputs: &[TensorData],
    f: F,
) -> Result<Differentiated<A>, DifferentiationError>
where
    F: FnOnce(&[TrackedTensor]) -> Result<(Tensor, A), LossError>,
{
    let tracked = inputs.iter().map(TrackedTensor::leaf).collect::<Result<Vec<_>, _>>()?;

    let (loss, aux) = f(&tracked)?;
    if loss.elem_count() != 1 {
        return Err(DifferentiationError::NotScalar(loss.dims().to_vec()));
    }
    let value = scalar_value(&loss)?;
    if !value.is_finite() {
        return Err(DifferentiationError::NonFiniteLoss(value));
    }

    let store = loss.backward()?;
    let mut gradients = Vec::with_capacity(tracked.len());
    for (input, tensor) in tracked.iter().enumerate() {
        let gradient = match store.get(tensor.as_tensor()) {
            Some(gradient) => gradient.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?,
            None if tensor.is_empty() => Vec::new(),
            None => return Err(DifferentiationError::Disconnected { input }),
        };
        if let Some(position) = gradient.iter().position(|g| !g.is_finite()) {
            return Err(DifferentiationError::NonFiniteGradient { input, position });
        }
        gradients.push(gradient);
    }

    Ok(Differentiated { loss: value, gradients, aux })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn test_sum_gradient_is_all_ones() {
        let inputs = vec![TensorData::floats(vec![-0.5, -1.0]), TensorData::floats(vec![-2.0])];
        let result = differentiate(&inputs, |tensors| {
            let total = tensors[0].sum()?.add(&tensors[1].sum()?)?;
            Ok((total, ()))
        })
        .unwrap();

        assert_close(result.loss, -3.5);
        assert_eq!(result.gradients, vec![vec![1.0, 1.0], vec![1.0]]);
    }

    #[test]
    fn test_product_rule_through_elements() {
        let inputs = vec![TensorData::floats(vec![3.0, 4.0])];
        let result = differentiate(&inputs, |tensors| {
            let x = tensors[0].get(0)?;
            let y = tensors[0].get(1)?;
            Ok((x.mul(&y)?.add(&x.exp()?)?, ()))
        })
        .unwrap();

        assert_close(result.loss, 12.0 + 3.0_f64.exp());
        assert_close(result.gradients[0][0], 4.0 + 3.0_f64.exp());
        assert_close(result.gradients[0][1], 3.0);
    }

    #[test]
    fn test_mean_and_dot() {
        let inputs = vec![TensorData::floats(vec![1.0, 2.0, 3.0, 4.0])];
        let result = differentiate(&inputs, |tensors| {
            let weighted = tensors[0].dot(&[1.0, 0.0, 2.0, 0.0])?;
            Ok((tensors[0].mean()?.add(&weighted)?, ()))
        })
        .unwrap();

        assert_close(result.loss, 2.5 + 7.0);
        let expected = [1.25, 0.25, 2.25, 0.25];
        for (actual, expected) in result.gradients[0].iter().zip(expected) {
            assert_close(*actual, expected);
        }
    }

    #[test]
    fn test_shaped_input_keeps_its_dimensions() {
        let inputs = vec![TensorData::floats(vec![1.0, 2.0, 3.0, 4.0]).with_shape(vec![2, 2])];
        let result = differentiate(&inputs, |tensors| {
            assert_eq!(tensors[0].shape(), &[2, 2]);
            let row_sums = tensors[0].as_tensor().sum(1)?;
            Ok((row_sums.sqr()?.sum_all()?, ()))
        })
        .unwrap();

        assert_close(result.loss, 9.0 + 49.0);
        assert_eq!(result.gradients, vec![vec![6.0, 6.0, 14.0, 14.0]]);
    }

    #[test]
    fn test_tensor_created_inside_the_loss_acts_as_constant() {
        let inputs = vec![TensorData::floats(vec![1.0, 2.0])];
        let result = differentiate(&inputs, |tensors| {
            let scale = Var::new(3.0, &Device::Cpu)?;
            Ok((tensors[0].sum()?.mul(scale.as_tensor())?, ()))
        })
        .unwrap();

        assert_close(result.loss, 9.0);
        assert_eq!(result.gradients, vec![vec![3.0, 3.0]]);
    }

    #[test]
    fn test_loss_error_is_propagated() {
        let inputs = vec![TensorData::floats(vec![1.0])];
        let error =
            differentiate::<(), _>(&inputs, |_| Err(LossError::from("bad batch"))).unwrap_err();
        assert_eq!(error, DifferentiationError::Loss(LossError::from("bad batch")));
    }

    #[test]
    fn test_non_finite_loss_is_rejected() {
        let inputs = vec![TensorData::floats(vec![-1.0])];
        let error = differentiate(&inputs, |t| Ok((t[0].sum()?.log()?, ()))).unwrap_err();
        assert!(matches!(error, DifferentiationError::NonFiniteLoss(_)));
    }

    #[test]
    fn test_non_scalar_loss_is_rejected() {
        let inputs = vec![TensorData::floats(vec![1.0, 2.0])];
        let error = differentiate(&inputs, |t| Ok((t[0].as_tensor().clone(), ()))).unwrap_err();
        assert_eq!(error, DifferentiationError::NotScalar(vec![2]));
    }

    #[test]
    fn test_disconnected_input_is_rejected() {
        let inputs = vec![TensorData::floats(vec![1.0]), TensorData::floats(vec![2.0])];
        let error = differentiate(&inputs, |t| Ok((t[0].sum()?, ()))).unwrap_err();
        assert_eq!(error, DifferentiationError::Disconnected { input: 1 });
    }

    #[test]
    fn test_empty_input_gets_empty_gradient() {
        let inputs = vec![TensorData::floats(vec![1.0]), TensorData::floats(vec![])];
        let result = differentiate(&inputs, |t| Ok((t[0].sum()?.affine(2.0, 0.0)?, ()))).unwrap();
        assert_eq!(result.gradients, vec![vec![2.0], vec![]]);
    }

    #[test]
    fn test_inconsistent_shape_is_rejected() {
        let inputs = vec![TensorData::floats(vec![1.0]).with_shape(vec![2])];
        let error = differentiate(&inputs, |t| Ok((t[0].sum()?, ()))).unwrap_err();
        assert!(matches!(error, DifferentiationError::Tensor(_)));
    }

    #[test]
    fn test_dot_length_mismatch() {
        let tensor = TrackedTensor::leaf(&TensorData::floats(vec![1.0, 2.0])).unwrap();
        assert!(tensor.dot(&[1.0]).is_err());
    }

    #[test]
    fn test_scalar_value_requires_one_element() {
        let tensor = TrackedTensor::leaf(&TensorData::floats(vec![1.5])).unwrap();
        assert_eq!(scalar_value(tensor.as_tensor()).unwrap(), 1.5);

        let tensor = TrackedTensor::leaf(&TensorData::floats(vec![1.0, 2.0])).unwrap();
        assert!(scalar_value(tensor.as_tensor()).is_err());
    }
}
