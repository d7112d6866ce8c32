//! Stage graphs used in production.

use super::{StageDefinition, StageRegistry};
use crate::errors::RegistryError;
use crate::retry::RetryPolicy;

/// Text extraction from the uploaded file.
pub const TEXT_EXTRACTION: &str = "text_extraction";
/// Document category detection.
pub const CLASSIFICATION: &str = "classification";
/// Embedded image extraction.
pub const IMAGE_EXTRACTION: &str = "image_extraction";
/// Table extraction.
pub const TABLE_EXTRACTION: &str = "table_extraction";
/// Category-specific entity extraction.
pub const ENTITY_EXTRACTION: &str = "entity_extraction";
/// Splitting text into retrieval chunks.
pub const CHUNKING: &str = "chunking";
/// Embedding generation for chunks.
pub const EMBEDDING: &str = "embedding";
/// Writing chunks, embeddings and entities to the search index.
pub const INDEXING: &str = "indexing";

/// The manual-ingestion graph.
///
/// ```text
/// text_extraction ─┬─> classification ─┬─> entity_extraction ───────────────┐
///                  │                   └─> chunking ─> embedding ─> indexing <┘
///                  ├─> image_extraction (optional)
///                  └─> table_extraction (optional)
/// ```
///
/// # Errors
///
/// Never fails in practice; the result is validated like any other graph.
pub fn document_pipeline() -> Result<StageRegistry, RegistryError> {
    StageRegistry::new(document_pipeline_definitions())
}

/// Definitions behind [`document_pipeline`], for callers that want to
/// adjust policies before building.
#[must_use]
pub fn document_pipeline_definitions() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new(TEXT_EXTRACTION),
        StageDefinition::new(CLASSIFICATION).depends_on(TEXT_EXTRACTION),
        StageDefinition::optional(IMAGE_EXTRACTION).depends_on(TEXT_EXTRACTION),
        StageDefinition::optional(TABLE_EXTRACTION).depends_on(TEXT_EXTRACTION),
        StageDefinition::new(ENTITY_EXTRACTION).depends_on(CLASSIFICATION),
        StageDefinition::new(CHUNKING).depends_on(CLASSIFICATION),
        StageDefinition::new(EMBEDDING)
            .depends_on(CHUNKING)
            .with_retry_policy(
                RetryPolicy::new()
                    .with_max_attempts(5)
                    .with_backoff_base_ms(2000),
            ),
        StageDefinition::new(INDEXING)
            .depends_on(EMBEDDING)
            .depends_on(ENTITY_EXTRACTION),
    ]
}

/// A linear `a -> b -> c ...` graph of required stages.
///
/// # Errors
///
/// Returns an error if `names` is empty or contains duplicates.
pub fn linear(names: &[&str]) -> Result<StageRegistry, RegistryError> {
    let defs = names.iter().enumerate().map(|(i, name)| {
        let def = StageDefinition::new(*name);
        match i.checked_sub(1).and_then(|prev| names.get(prev)) {
            Some(prev) => def.depends_on(*prev),
            None => def,
        }
    });
    StageRegistry::new(defs)
}
