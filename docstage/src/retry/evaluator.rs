//! Retry decisions.

use super::RetryPolicy;
use crate::core::ErrorType;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::time::Duration;

/// Why a failed stage will not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The error type is not in the policy's retryable set.
    NonRetryable,
    /// The stage has used all its attempts.
    Exhausted,
}

impl TerminationReason {
    /// Returns the reason as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NonRetryable => "non_retryable",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the stage to pending and run it again after the delay.
    Retry(Duration),
    /// Mark the stage failed.
    Terminate(TerminationReason),
}

impl RetryDecision {
    /// Returns true for [`RetryDecision::Retry`].
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Decides whether a failed attempt is retried, and when.
///
/// The evaluator owns its random source so tests can make jitter
/// reproducible with [`RetryEvaluator::seeded`].
pub struct RetryEvaluator {
    rng: Mutex<StdRng>,
}

impl RetryEvaluator {
    /// Creates an evaluator seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates an evaluator with a fixed seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Decides the outcome of a failed attempt.
    ///
    /// `attempt_count` is the number of attempts made so far, including
    /// the one that just failed.
    #[must_use]
    pub fn decide(
        &self,
        policy: &RetryPolicy,
        error_type: ErrorType,
        attempt_count: u32,
    ) -> RetryDecision {
        let mut rng = self.rng.lock();
        decide_with_rng(policy, error_type, attempt_count, &mut *rng)
    }
}

impl Default for RetryEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetryEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEvaluator").finish_non_exhaustive()
    }
}

/// Decides the outcome of a failed attempt with the given random source.
#[must_use]
pub fn decide_with_rng<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    error_type: ErrorType,
    attempt_count: u32,
    rng: &mut R,
) -> RetryDecision {
    if !policy.is_retryable(error_type) {
        return RetryDecision::Terminate(TerminationReason::NonRetryable);
    }
    if attempt_count >= policy.max_attempts {
        return RetryDecision::Terminate(TerminationReason::Exhausted);
    }

    let base = base_delay_ms(policy, error_type, attempt_count);
    let jittered = if policy.jitter_fraction > 0.0 && base > 0.0 {
        let spread = policy.jitter_fraction.min(1.0);
        base * (1.0 + rng.gen_range(-spread..=spread))
    } else {
        base
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let capped = jittered.clamp(0.0, policy.max_backoff_ms as f64) as u64;
    RetryDecision::Retry(Duration::from_millis(capped))
}

/// Un-jittered delay for the retry following attempt `attempt_count`.
///
/// The first retry waits `backoff_base_ms`; each further attempt multiplies
/// it by `backoff_multiplier`. `ResourceExhausted` failures wait longer.
#[must_use]
pub fn base_delay_ms(policy: &RetryPolicy, error_type: ErrorType, attempt_count: u32) -> f64 {
    let exponent = i32::try_from(attempt_count.saturating_sub(1)).unwrap_or(i32::MAX);
    #[allow(clippy::cast_precision_loss)]
    let mut delay = policy.backoff_base_ms as f64 * policy.backoff_multiplier.powi(exponent);
    if error_type == ErrorType::ResourceExhausted {
        delay *= policy.resource_exhausted_factor;
    }
    if delay.is_finite() {
        delay
    } else {
        f64::MAX
    }
}
