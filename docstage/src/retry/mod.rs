//! Retry policies, failure classification and retry decisions.
//!
//! This module provides:
//! - [`RetryPolicy`], the immutable per-stage retry configuration
//! - [`classify`] and [`classify_anyhow`], mapping failures onto [`ErrorType`](crate::core::ErrorType)
//! - [`RetryEvaluator`], deciding between a delayed retry and termination

mod classify;
mod evaluator;
mod policy;

pub use classify::{classify, classify_anyhow, classify_message, StageError};
pub use evaluator::{base_delay_ms, decide_with_rng, RetryDecision, RetryEvaluator, TerminationReason};
pub use policy::RetryPolicy;
