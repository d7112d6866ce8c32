//! Observability utilities.
//!
//! Structured logs come from `tracing` calls throughout the crate; this
//! module installs the subscriber. Lifecycle events go through
//! [`EventSink`](crate::events::EventSink).

mod logging;

pub use logging::{env_filter, init_tracing};
