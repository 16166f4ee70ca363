//! ABI descriptor merging across input objects.
//!
//! Each object file may embed a JSON ABI blob. After the module commits,
//! the writer folds every blob through an [`AbiMerger`] and writes the
//! result next to the module, with the extension replaced by `.abi`. The
//! merge algorithm itself is a collaborator; [`JsonAbiMerger`] is the
//! bundled default, a recursive object union.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbiError {
    #[error("failed to parse abi: {0}")]
    Parse(String),
    #[error("failed to merge abi: {0}")]
    Merge(String),
}

/// Collaborator folding per-file ABI blobs into one document.
pub trait AbiMerger {
    /// Install the initial document.
    fn seed(&mut self, blob: &str) -> Result<(), AbiError>;
    /// Merge one blob into the current document.
    fn fold(&mut self, blob: &str) -> Result<(), AbiError>;
    /// Serialize the merged document.
    fn render(&self) -> String;
}

/// Sibling path of the output file with the extension replaced.
pub fn abi_output_path(output_file: &Path) -> PathBuf {
    output_file.with_extension("abi")
}

/// Default merger: parses blobs as JSON and takes the recursive union.
/// Objects merge key-wise, arrays concatenate (deduplicated by value),
/// scalars keep the already-merged side.
#[derive(Debug, Default)]
pub struct JsonAbiMerger {
    doc: Value,
}

impl JsonAbiMerger {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(blob: &str) -> Result<Value, AbiError> {
        serde_json::from_str(blob).map_err(|e| AbiError::Parse(e.to_string()))
    }

    fn union(base: &mut Value, other: Value) {
        match (base, other) {
            (Value::Object(base), Value::Object(other)) => {
                for (key, value) in other {
                    match base.get_mut(&key) {
                        Some(existing) => Self::union(existing, value),
                        None => {
                            base.insert(key, value);
                        }
                    }
                }
            }
            (Value::Array(base), Value::Array(other)) => {
                for value in other {
                    if !base.contains(&value) {
                        base.push(value);
                    }
                }
            }
            _ => {}
        }
    }
}

impl AbiMerger for JsonAbiMerger {
    fn seed(&mut self, blob: &str) -> Result<(), AbiError> {
        self.doc = Self::parse(blob)?;
        Ok(())
    }

    fn fold(&mut self, blob: &str) -> Result<(), AbiError> {
        let other = Self::parse(blob)?;
        if !matches!(other, Value::Object(_)) {
            return Err(AbiError::Merge("abi document is not an object".into()));
        }
        Self::union(&mut self.doc, other);
        Ok(())
    }

    fn render(&self) -> String {
        self.doc.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_output_path() {
        assert_eq!(
            abi_output_path(Path::new("out/contract.wasm")),
            PathBuf::from("out/contract.abi")
        );
    }

    #[test]
    fn test_union_merges_actions() {
        let mut merger = JsonAbiMerger::new();
        merger
            .seed(r#"{"version":"snax::abi/1.0","actions":[{"name":"transfer"}]}"#)
            .unwrap();
        merger
            .fold(r#"{"actions":[{"name":"issue"}],"tables":[]}"#)
            .unwrap();
        let merged: Value = serde_json::from_str(&merger.render()).unwrap();
        assert_eq!(merged["actions"].as_array().unwrap().len(), 2);
        assert_eq!(merged["version"], "snax::abi/1.0");
        assert!(merged["tables"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_fold_dedups() {
        let mut merger = JsonAbiMerger::new();
        merger.seed(r#"{"actions":[{"name":"transfer"}]}"#).unwrap();
        merger.fold(r#"{"actions":[{"name":"transfer"}]}"#).unwrap();
        let merged: Value = serde_json::from_str(&merger.render()).unwrap();
        assert_eq!(merged["actions"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_error() {
        let mut merger = JsonAbiMerger::new();
        assert!(matches!(merger.seed("not json"), Err(AbiError::Parse(_))));
    }
}
