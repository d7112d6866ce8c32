//! Static stage definitions.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Definition of a single processing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,
    /// Whether a terminal failure of this stage blocks the document.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Names of stages that must be completed or skipped first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Retry policy used unless an override is stored.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
}

fn default_required() -> bool {
    true
}

impl StageDefinition {
    /// Creates a required stage with no dependencies and the default policy.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            depends_on: BTreeSet::new(),
            default_retry_policy: RetryPolicy::default(),
        }
    }

    /// Creates an optional stage.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self::new(name).with_required(false)
    }

    /// Sets whether the stage is required.
    #[must_use]
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.insert(stage.into());
        self
    }

    /// Replaces the dependency set.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    /// Returns true if the stage has no dependencies.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}
