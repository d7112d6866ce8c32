//! Document and stage identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a document moving through the pipeline.
///
/// The trigger surface is responsible for sanitizing identifiers; the
/// tracker only rejects blank ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a document identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier is empty or whitespace-only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Key of a single stage execution row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageKey {
    /// The document.
    pub document_id: DocumentId,
    /// The stage name.
    pub stage_name: String,
}

impl StageKey {
    /// Creates a stage key.
    #[must_use]
    pub fn new(document_id: impl Into<DocumentId>, stage_name: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            stage_name: stage_name.into(),
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_id, self.stage_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_document_id() {
        assert!(DocumentId::new("").is_blank());
        assert!(DocumentId::new("   ").is_blank());
        assert!(!DocumentId::new("manual-42").is_blank());
    }

    #[test]
    fn test_stage_key_display() {
        let key = StageKey::new("doc-1", "chunking");
        assert_eq!(key.to_string(), "doc-1/chunking");
    }

    #[test]
    fn test_document_id_is_transparent_in_json() {
        let json = serde_json::to_string(&DocumentId::new("d1")).unwrap();
        assert_eq!(json, r#""d1""#);
    }
}
