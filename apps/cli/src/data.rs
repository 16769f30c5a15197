//! JSONL training data loading.
//!
//! Each non-blank line is either a full datum
//! (`{"model_input": ..., "loss_fn_inputs": ...}`) or the short form
//! `{"tokens": [...], "targets": [...], "weights": [...]}` where `weights`
//! is optional.

use anyhow::{bail, Context, Result};
use gradwire_abstraction::{Datum, ModelInput, TensorData};
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize)]
#[serde(untagged)]
enum DataLine {
    Full(Datum),
    Short {
        tokens: Vec<i64>,
        targets: Vec<i64>,
        #[serde(default)]
        weights: Option<Vec<f64>>,
    },
}

impl DataLine {
    fn into_datum(self) -> Result<Datum> {
        match self {
            Self::Full(datum) => Ok(datum),
            Self::Short { tokens, targets, weights } => {
                let mut datum =
                    Datum::new(ModelInput::from_ints(tokens), TensorData::ints(&targets));
                if let Some(weights) = weights {
                    if weights.len() != targets.len() {
                        bail!("{} weights for {} targets", weights.len(), targets.len());
                    }
                    datum = datum.with_loss_fn_input(Datum::WEIGHTS, TensorData::floats(weights));
                }
                Ok(datum)
            }
        }
    }
}

/// Parses JSONL content into data.
pub fn parse_jsonl(content: &str) -> Result<Vec<Datum>> {
    let mut data = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: DataLine = serde_json::from_str(line)
            .with_context(|| format!("Line {}: not a datum", index + 1))?;
        data.push(parsed.into_datum().with_context(|| format!("Line {}", index + 1))?);
    }
    if data.is_empty() {
        bail!("No data found");
    }
    Ok(data)
}

/// Reads a JSONL data file.
pub fn load_jsonl(path: &Path) -> Result<Vec<Datum>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read data file {}", path.display()))?;
    parse_jsonl(&content).with_context(|| format!("Invalid data file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_short_and_full_forms() {
        let full = serde_json::to_string(&Datum::new(
            ModelInput::from_ints(vec![4, 5]),
            TensorData::ints(&[5, 6]),
        ))
        .unwrap();
        let content = format!(
            "{{\"tokens\": [1, 2], \"targets\": [2, 3], \"weights\": [1.0, 0.5]}}\n\n{}\n",
            full
        );

        let data = parse_jsonl(&content).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].model_input.to_ints(), vec![1, 2]);
        assert_eq!(data[0].weights().unwrap().data, vec![1.0, 0.5]);
        assert_eq!(data[1].target_tokens().unwrap().to_ints(), vec![5, 6]);
    }

    #[test]
    fn test_parse_reports_line_number() {
        let error = parse_jsonl("{\"tokens\": [1], \"targets\": [2]}\nnot json\n").unwrap_err();
        assert!(format!("{:#}", error).contains("Line 2"));
    }

    #[test]
    fn test_weights_must_match_targets() {
        let mismatched = "{\"tokens\": [1], \"targets\": [2], \"weights\": [1.0, 1.0]}";
        assert!(parse_jsonl(mismatched).is_err());
    }

    #[test]
    fn test_empty_file_is_rejected() {
        assert!(parse_jsonl("\n\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let error = load_jsonl(&temp_dir.path().join("absent.jsonl")).unwrap_err();
        assert!(error.to_string().contains("Failed to read data file"));
    }
}
