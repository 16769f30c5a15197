//! Wire-transmissible tensors.

use serde::{Deserialize, Serialize};

/// Element type of a [`TensorData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 64-bit signed integers (token ids).
    Int64,
    /// 32-bit floats (logprobs, weights, advantages).
    Float32,
}

/// Flat representation of an n-dimensional numeric array.
///
/// Values are held as `f64` in memory regardless of dtype; integer dtypes are
/// encoded as integral JSON numbers on the wire. A `None` shape means rank 1
/// with `data.len()` elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TensorDataWire", try_from = "TensorDataWire")]
pub struct TensorData {
    /// Row-major element storage.
    pub data: Vec<f64>,
    /// Element type.
    pub dtype: DType,
    /// Dimensions, or `None` for a plain vector.
    pub shape: Option<Vec<usize>>,
}

impl TensorData {
    /// Creates a rank-1 float tensor.
    #[must_use]
    pub fn floats(data: Vec<f64>) -> Self {
        Self { data, dtype: DType::Float32, shape: None }
    }

    /// Creates a rank-1 integer tensor.
    #[must_use]
    pub fn ints(data: &[i64]) -> Self {
        Self { data: data.iter().map(|&v| v as f64).collect(), dtype: DType::Int64, shape: None }
    }

    /// Sets an explicit shape.
    #[must_use]
    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The shape, with the rank-1 default filled in.
    pub fn effective_shape(&self) -> Vec<usize> {
        self.shape.clone().unwrap_or_else(|| vec![self.data.len()])
    }

    /// Elements rounded to integers.
    pub fn to_ints(&self) -> Vec<i64> {
        self.data.iter().map(|v| v.round() as i64).collect()
    }

    /// Checks that the declared shape covers exactly `data.len()` elements.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(shape) = &self.shape {
            let expected: usize = shape.iter().product();
            if expected != self.data.len() {
                return Err(format!(
                    "shape {:?} implies {} elements but data has {}",
                    shape,
                    expected,
                    self.data.len()
                ));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct TensorDataWire {
    data: WireValues,
    dtype: DType,
    #[serde(default)]
    shape: Option<Vec<usize>>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireValues {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl From<TensorData> for TensorDataWire {
    fn from(tensor: TensorData) -> Self {
        let data = match tensor.dtype {
            DType::Int64 => WireValues::Int(tensor.data.iter().map(|v| v.round() as i64).collect()),
            DType::Float32 => WireValues::Float(tensor.data),
        };
        Self { data, dtype: tensor.dtype, shape: tensor.shape }
    }
}

impl TryFrom<TensorDataWire> for TensorData {
    type Error = String;

    fn try_from(wire: TensorDataWire) -> Result<Self, Self::Error> {
        let data = match wire.data {
            WireValues::Int(values) => values.into_iter().map(|v| v as f64).collect(),
            WireValues::Float(values) => {
                if wire.dtype == DType::Int64 && values.iter().any(|v| v.fract() != 0.0) {
                    return Err("int64 tensor contains non-integral values".to_string());
                }
                values
            }
        };
        let tensor = Self { data, dtype: wire.dtype, shape: wire.shape };
        tensor.validate()?;
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int_tensor_serializes_integral_numbers() {
        let tensor = TensorData::ints(&[5, 17, 3]);
        let value = serde_json::to_value(&tensor).unwrap();
        assert_eq!(value, json!({"data": [5, 17, 3], "dtype": "int64", "shape": null}));
    }

    #[test]
    fn test_float_tensor_deserialization_with_shape() {
        let tensor: TensorData = serde_json::from_value(json!({
            "data": [0.1, 0.2, 0.3, 0.4],
            "dtype": "float32",
            "shape": [2, 2]
        }))
        .unwrap();
        assert_eq!(tensor.dtype, DType::Float32);
        assert_eq!(tensor.effective_shape(), vec![2, 2]);
        assert_eq!(tensor.numel(), 4);
    }

    #[test]
    fn test_float_tensor_with_integral_values_stays_float() {
        let tensor: TensorData =
            serde_json::from_value(json!({"data": [1, 0, 1], "dtype": "float32"})).unwrap();
        assert_eq!(tensor.data, vec![1.0, 0.0, 1.0]);
        assert_eq!(tensor.dtype, DType::Float32);
        assert!(tensor.shape.is_none());
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let result: Result<TensorData, _> = serde_json::from_value(json!({
            "data": [1.5, 2.5, 3.5],
            "dtype": "float32",
            "shape": [2, 2]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_integral_int64_is_rejected() {
        let result: Result<TensorData, _> =
            serde_json::from_value(json!({"data": [1.5], "dtype": "int64"}));
        assert!(result.is_err());
    }
}
