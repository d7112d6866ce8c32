//! The static stage graph.
//!
//! A [`StageRegistry`] is built once at startup from [`StageDefinition`]s and
//! rejects empty, duplicate, self-referencing, dangling or cyclic graphs.

mod definition;
mod graph;
pub mod presets;

pub use definition::StageDefinition;
pub use graph::{validate, StageRegistry};
pub use presets::document_pipeline;
