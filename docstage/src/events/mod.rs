//! Lifecycle events for observability.
//!
//! The orchestrator emits a [`PipelineEvent`] for every state transition to
//! an [`EventSink`]. Sinks are passive observers and cannot veto anything.

mod event;
mod sink;

pub use event::PipelineEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
