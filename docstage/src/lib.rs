//! # Docstage
//!
//! Stage orchestration for multi-stage document processing pipelines.
//!
//! Docstage tracks every document through a directed graph of processing
//! stages (text extraction, classification, chunking, embedding, ...) and
//! provides:
//!
//! - **A validated stage graph**: dependencies, required/optional stages and
//!   per-stage retry policies, rejected at startup if cyclic
//! - **Durable per-stage state**: one row per (document, stage), changed only
//!   through legal transitions and a storage-level compare-and-swap
//! - **Retries with backoff**: failures are classified (transient, resource
//!   exhausted, validation, ...) and retried or surfaced for review
//! - **A worker pool**: a delay-aware queue, stage handlers, a stale-run
//!   reaper and graceful shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docstage::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = docstage::registry::document_pipeline()?;
//! let orchestrator = Arc::new(Orchestrator::new(registry, Stores::in_memory()));
//!
//! let handlers = HandlerRegistry::new()
//!     .with_handler("text_extraction", Arc::new(ExtractText))
//!     .with_handler("classification", Arc::new(Classify));
//! let pool = WorkerPool::start(orchestrator.clone(), handlers, 4, SchedulerConfig::default());
//!
//! pool.submit(&DocumentId::new("doc-42")).await?;
//! let progress = orchestrator.get_document_progress(&DocumentId::new("doc-42")).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{LoggingConfig, OrchestratorConfig, SchedulerConfig, StoreConfig};
    pub use crate::core::{
        DocumentId, DocumentStatus, ErrorStatus, ErrorType, ExecutionStatus, Severity, StageKey,
    };
    pub use crate::errors::{
        ConfigError, OrchestratorError, OrchestratorResult, RegistryError, StoreError,
    };
    pub use crate::events::{
        CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent,
    };
    pub use crate::orchestrator::{
        Advance, AttemptToken, FailureOutcome, Orchestrator, ProgressView, StageProgress,
        StageStatistics, StartCheck,
    };
    pub use crate::registry::{StageDefinition, StageRegistry};
    pub use crate::retry::{RetryDecision, RetryEvaluator, RetryPolicy, StageError};
    pub use crate::scheduler::{
        HandlerContext, HandlerOutcome, HandlerRegistry, SchedulingQueue, ShutdownSignal,
        StageHandler, WorkerPool,
    };
    pub use crate::store::{
        CompletionMarker, Metadata, PipelineError, PipelineErrorLog, StageExecution,
        StageStateStore, Stores,
    };
    pub use crate::utils::{Clock, ManualClock, SystemClock};
}
