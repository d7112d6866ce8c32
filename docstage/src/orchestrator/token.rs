//! Attempt ownership tokens.

use crate::core::{DocumentId, StageKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Proof that the holder owns one running attempt of a stage.
///
/// Issued by `start_stage`. Every later call for the attempt presents it;
/// once the row moves on (retry, reset, reaping) the token is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptToken {
    document_id: DocumentId,
    stage_name: String,
    attempt: u32,
    token_id: Uuid,
}

impl AttemptToken {
    pub(crate) fn new(document_id: DocumentId, stage_name: String, attempt: u32, token_id: Uuid) -> Self {
        Self {
            document_id,
            stage_name,
            attempt,
            token_id,
        }
    }

    /// The document.
    #[must_use]
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// The stage.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Attempt number, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Unique id of the attempt.
    #[must_use]
    pub const fn token_id(&self) -> Uuid {
        self.token_id
    }

    /// The row key.
    #[must_use]
    pub fn key(&self) -> StageKey {
        StageKey::new(self.document_id.clone(), self.stage_name.clone())
    }
}

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.document_id, self.stage_name, self.attempt)
    }
}
