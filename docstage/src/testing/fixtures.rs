//! Test fixtures: registries and a wired-up orchestrator.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::errors::RegistryError;
use crate::events::CollectingEventSink;
use crate::orchestrator::Orchestrator;
use crate::registry::{StageDefinition, StageRegistry};
use crate::retry::{RetryEvaluator, RetryPolicy};
use crate::store::{InMemoryErrorLog, InMemoryStageStore, Stores};
use crate::utils::ManualClock;

/// A fixed, readable start time for manual clocks.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Retry policy without jitter, so delays are exact.
#[must_use]
pub fn deterministic_policy() -> RetryPolicy {
    RetryPolicy::new().with_jitter_fraction(0.0)
}

/// `a -> b -> c`, all required, deterministic retries.
pub fn linear_registry() -> Result<StageRegistry, RegistryError> {
    StageRegistry::new(["a", "b", "c"].iter().enumerate().map(|(i, name)| {
        let def = StageDefinition::new(*name).with_retry_policy(deterministic_policy());
        match i {
            0 => def,
            1 => def.depends_on("a"),
            _ => def.depends_on("b"),
        }
    }))
}

/// `a -> {b (optional), c} -> d`, deterministic retries.
pub fn diamond_registry() -> Result<StageRegistry, RegistryError> {
    let policy = deterministic_policy();
    StageRegistry::new([
        StageDefinition::new("a").with_retry_policy(policy.clone()),
        StageDefinition::optional("b")
            .depends_on("a")
            .with_retry_policy(policy.clone()),
        StageDefinition::new("c")
            .depends_on("a")
            .with_retry_policy(policy.clone()),
        StageDefinition::new("d")
            .depends_on("b")
            .depends_on("c")
            .with_retry_policy(policy),
    ])
}

/// An orchestrator over in-memory stores, a manual clock and a collecting
/// event sink, with handles to all of them.
#[derive(Debug)]
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Arc<Orchestrator>,
    /// The clock it reads.
    pub clock: ManualClock,
    /// Every event it emitted.
    pub events: Arc<CollectingEventSink>,
    /// Its state store.
    pub state: Arc<InMemoryStageStore>,
    /// Its error log.
    pub errors: Arc<InMemoryErrorLog>,
}

impl TestHarness {
    /// Wires a harness around a registry.
    #[must_use]
    pub fn new(registry: StageRegistry) -> Self {
        let clock = ManualClock::new(epoch());
        let events = Arc::new(CollectingEventSink::new());
        let state = Arc::new(InMemoryStageStore::new());
        let errors = Arc::new(InMemoryErrorLog::new());
        let stores = Stores {
            state: state.clone(),
            errors: errors.clone(),
        };
        let orchestrator = Orchestrator::new(registry, stores)
            .with_clock(Arc::new(clock.clone()))
            .with_event_sink(events.clone())
            .with_evaluator(RetryEvaluator::seeded(7));
        Self {
            orchestrator: Arc::new(orchestrator),
            clock,
            events,
            state,
            errors,
        }
    }

    /// Harness over [`linear_registry`].
    pub fn linear() -> Result<Self, RegistryError> {
        Ok(Self::new(linear_registry()?))
    }

    /// Harness over [`diamond_registry`].
    pub fn diamond() -> Result<Self, RegistryError> {
        Ok(Self::new(diamond_registry()?))
    }
}
