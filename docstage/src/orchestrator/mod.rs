//! Stage orchestration.
//!
//! The [`Orchestrator`] owns the legal transitions of every stage row:
//!
//! ```text
//! pending ──start──▶ running ──complete──▶ completed
//!    ▲                  │
//!    └──retry (backoff)─┤──terminal──▶ failed
//!                       └──skip──────▶ skipped
//! ```
//!
//! Callers never write rows directly. Attempts are identified by an
//! [`AttemptToken`]; a token whose row has moved on is rejected.

mod locks;
mod progress;
mod stats;
mod token;
mod tracker;

pub use progress::{ProgressView, StageProgress};
pub use stats::StageStatistics;
pub use token::AttemptToken;
pub use tracker::{Advance, FailureOutcome, Orchestrator, StartCheck, SKIP_REASON_KEY};
