//! Stage handler seam.

use crate::core::DocumentId;
use crate::errors::OrchestratorResult;
use crate::orchestrator::{AttemptToken, Orchestrator};
use crate::store::Metadata;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a handler reports for a successful run.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The stage did its work; metadata is merged into the row.
    Completed {
        /// Output metadata.
        metadata: Metadata,
    },
    /// The stage decided there is nothing to do for this document.
    Skipped {
        /// Why.
        reason: String,
    },
}

impl HandlerOutcome {
    /// Completed without metadata.
    #[must_use]
    pub fn completed() -> Self {
        Self::Completed {
            metadata: Metadata::new(),
        }
    }

    /// Completed with metadata.
    #[must_use]
    pub const fn completed_with(metadata: Metadata) -> Self {
        Self::Completed { metadata }
    }

    /// Skipped with a reason.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Everything a handler sees of its attempt.
pub struct HandlerContext {
    orchestrator: Arc<Orchestrator>,
    token: AttemptToken,
    metadata: Metadata,
    upstream: HashMap<String, Metadata>,
}

impl HandlerContext {
    pub(crate) fn new(
        orchestrator: Arc<Orchestrator>,
        token: AttemptToken,
        metadata: Metadata,
        upstream: HashMap<String, Metadata>,
    ) -> Self {
        Self {
            orchestrator,
            token,
            metadata,
            upstream,
        }
    }

    /// The document.
    #[must_use]
    pub fn document_id(&self) -> &DocumentId {
        self.token.document_id()
    }

    /// The stage.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        self.token.stage_name()
    }

    /// Attempt number, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.token.attempt()
    }

    /// The attempt token.
    #[must_use]
    pub const fn token(&self) -> &AttemptToken {
        &self.token
    }

    /// Metadata stored on the row before this attempt started.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Metadata of one completed direct dependency.
    #[must_use]
    pub fn upstream(&self, stage: &str) -> Option<&Metadata> {
        self.upstream.get(stage)
    }

    /// Metadata of every completed direct dependency.
    #[must_use]
    pub const fn upstream_all(&self) -> &HashMap<String, Metadata> {
        &self.upstream
    }

    /// Reports progress of the running attempt.
    pub async fn report_progress(&self, percent: f64, metadata: Metadata) -> OrchestratorResult<()> {
        self.orchestrator
            .update_stage_progress(&self.token, percent, metadata)
            .await
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("token", &self.token)
            .field("metadata", &self.metadata)
            .field("upstream", &self.upstream.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Work performed by one stage.
///
/// Errors are classified from their message and cause chain; return a
/// [`StageError`](crate::retry::StageError) to choose the type explicitly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Runs the stage for the attempt described by `ctx`.
    async fn run(&self, ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome>;
}

/// Maps stage names to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for the stage.
    #[must_use]
    pub fn with_handler(mut self, stage: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        self.register(stage, handler);
        self
    }

    /// Registers a handler in place.
    pub fn register(&mut self, stage: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage.into(), handler);
    }

    /// The handler of a stage.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage).cloned()
    }

    /// Returns whether a stage has a handler.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.handlers.contains_key(stage)
    }

    /// Stage names with handlers, sorted.
    #[must_use]
    pub fn stages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("stages", &self.stages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let handler: Arc<dyn StageHandler> = Arc::new(MockStageHandler::new());
        let registry = HandlerRegistry::new()
            .with_handler("b", Arc::clone(&handler))
            .with_handler("a", handler);

        assert!(registry.contains("a"));
        assert!(registry.get("c").is_none());
        assert_eq!(registry.stages(), vec!["a", "b"]);
    }

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(
            HandlerOutcome::completed(),
            HandlerOutcome::Completed {
                metadata: Metadata::new()
            }
        );
        assert_eq!(
            HandlerOutcome::skipped("no images"),
            HandlerOutcome::Skipped {
                reason: "no images".to_string()
            }
        );
    }
}
