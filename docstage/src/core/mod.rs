//! Core domain model types for docstage.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Execution, error and document status enums
//! - The failure taxonomy and severity levels
//! - Document and stage identifiers

mod error_type;
mod ids;
mod status;

pub use error_type::{ErrorType, Severity};
pub use ids::{DocumentId, StageKey};
pub use status::{DocumentStatus, ErrorStatus, ExecutionStatus, UnknownVariant};
