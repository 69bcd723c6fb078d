//! Label table: output index → human-readable class name.
//!
//! The table ships next to the model file and must be versioned with it: a
//! mismatched table produces meaningless labels. An optional SHA-256 of the
//! model bytes turns that silent mismatch into a load error.
//!
//! ```json
//! {
//!   "version": "ast-siren-1",
//!   "modelSha256": "3f1c…",
//!   "labels": ["Background", "Siren"],
//!   "background": ["Background"]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Result, SoundwatchError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelTable {
    /// Free-form version tag shared with the model release.
    #[serde(default)]
    pub version: Option<String>,
    /// Lowercase hex SHA-256 of the model file this table belongs to.
    #[serde(default)]
    pub model_sha256: Option<String>,
    /// Class names indexed by model output position.
    pub labels: Vec<String>,
    /// Labels that mean "nothing worth reporting".
    #[serde(default)]
    pub background: Vec<String>,
}

impl LabelTable {
    /// Build a table from class names, marking `background` labels as
    /// non-events.
    pub fn new<I, S>(labels: I, background: &[&str]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: None,
            model_sha256: None,
            labels: labels.into_iter().map(Into::into).collect(),
            background: background.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Table for the bundled siren model: 0 → Background, 1 → Siren.
    pub fn siren_default() -> Self {
        Self::new(["Background", "Siren"], &["Background"])
    }

    /// Parse a JSON table.
    ///
    /// # Errors
    /// `ModelLoad` for malformed JSON or an empty label list.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(raw)
            .map_err(|e| SoundwatchError::ModelLoad(format!("invalid label table: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    /// Read and parse a JSON table from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SoundwatchError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        let table = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        info!(
            path = %path.display(),
            version = table.version.as_deref().unwrap_or("unversioned"),
            classes = table.labels.len(),
            "loaded label table"
        );
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(SoundwatchError::ModelLoad("label table has no labels".into()));
        }
        if let Some(unknown) = self.background.iter().find(|b| !self.labels.contains(b)) {
            return Err(SoundwatchError::ModelLoad(format!(
                "background label '{unknown}' is not in the label list"
            )));
        }
        Ok(())
    }

    /// Reject model bytes that do not match the pinned fingerprint. Tables
    /// without a fingerprint accept any model.
    pub fn verify_model(&self, model_bytes: &[u8]) -> Result<()> {
        let Some(expected) = self.model_sha256.as_deref() else {
            return Ok(());
        };
        let actual = model_fingerprint(model_bytes);
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(SoundwatchError::ModelLoad(format!(
                "label table {} was built for model {expected}, got {actual}",
                self.version.as_deref().unwrap_or("(unversioned)")
            )))
        }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn is_background(&self, label: &str) -> bool {
        self.background.iter().any(|b| b == label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::siren_default()
    }
}

/// Lowercase hex SHA-256 of a model file.
pub fn model_fingerprint(model_bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(model_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siren_table_maps_indices() {
        let table = LabelTable::siren_default();
        assert_eq!(table.get(0), Some("Background"));
        assert_eq!(table.get(1), Some("Siren"));
        assert_eq!(table.get(2), None);
        assert!(table.is_background("Background"));
        assert!(!table.is_background("Siren"));
    }

    #[test]
    fn parses_camel_case_json() {
        let table = LabelTable::from_json_str(
            r#"{"version":"v2","labels":["Background","Siren","Horn"],"background":["Background"]}"#,
        )
        .expect("parse label table");
        assert_eq!(table.version.as_deref(), Some("v2"));
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2), Some("Horn"));
    }

    #[test]
    fn rejects_empty_or_inconsistent_tables() {
        assert!(LabelTable::from_json_str(r#"{"labels":[]}"#).is_err());
        assert!(
            LabelTable::from_json_str(r#"{"labels":["Siren"],"background":["Noise"]}"#).is_err()
        );
        assert!(LabelTable::from_json_str("not json").is_err());
    }

    #[test]
    fn fingerprint_pins_model_bytes() {
        let model = b"fake graph bytes";
        let mut table = LabelTable::siren_default();
        assert!(table.verify_model(b"anything").is_ok());

        table.model_sha256 = Some(model_fingerprint(model).to_uppercase());
        assert!(table.verify_model(model).is_ok());
        assert!(matches!(
            table.verify_model(b"other graph"),
            Err(SoundwatchError::ModelLoad(_))
        ));
    }

    #[test]
    fn missing_file_is_model_not_found() {
        assert!(matches!(
            LabelTable::from_path("/nonexistent/labels.json"),
            Err(SoundwatchError::ModelNotFound { .. })
        ));
    }
}
