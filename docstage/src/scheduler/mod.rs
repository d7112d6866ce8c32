//! Scheduling queue and worker pool.
//!
//! The pool pulls `(document, stage)` keys from a [`SchedulingQueue`],
//! drives each through the [`Orchestrator`](crate::orchestrator::Orchestrator)
//! and runs the stage's [`StageHandler`]. No state lives here that the
//! store does not also hold: a restarted pool rebuilds its queue from the
//! eligibility scan.

mod handler;
mod queue;
mod shutdown;
mod worker;

#[cfg(test)]
pub(crate) use handler::MockStageHandler;
pub use handler::{HandlerContext, HandlerOutcome, HandlerRegistry, StageHandler};
pub use queue::SchedulingQueue;
pub use shutdown::ShutdownSignal;
pub use worker::WorkerPool;
