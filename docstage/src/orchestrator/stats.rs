//! Per-stage statistics for alerting.

use crate::core::ExecutionStatus;
use crate::registry::StageRegistry;
use crate::store::StageExecution;
use serde::Serialize;
use std::collections::HashMap;

/// Counts and durations of one stage across all documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStatistics {
    /// The stage.
    pub stage_name: String,
    /// Rows waiting to run.
    pub pending: usize,
    /// Rows running.
    pub running: usize,
    /// Rows completed.
    pub completed: usize,
    /// Rows failed terminally.
    pub failed: usize,
    /// Rows skipped.
    pub skipped: usize,
    /// Attempts across all rows since their last reset.
    pub total_attempts: u64,
    /// Mean duration of completed attempts.
    pub mean_duration_ms: Option<f64>,
    /// 95th percentile duration of completed attempts.
    pub p95_duration_ms: Option<i64>,
    /// Longest completed attempt.
    pub max_duration_ms: Option<i64>,
}

impl StageStatistics {
    /// Share of finished rows that failed, 0.0..=1.0.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let finished = self.completed + self.failed + self.skipped;
        if finished == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.failed as f64 / finished as f64;
        rate
    }
}

pub(crate) fn compute(registry: &StageRegistry, rows: &[StageExecution]) -> Vec<StageStatistics> {
    let mut stats: HashMap<&str, StageStatistics> = HashMap::new();
    let mut durations: HashMap<&str, Vec<i64>> = HashMap::new();

    for row in rows {
        let entry = stats.entry(row.stage_name.as_str()).or_default();
        match row.status {
            ExecutionStatus::Pending => entry.pending += 1,
            ExecutionStatus::Running => entry.running += 1,
            ExecutionStatus::Completed => entry.completed += 1,
            ExecutionStatus::Failed => entry.failed += 1,
            ExecutionStatus::Skipped => entry.skipped += 1,
        }
        entry.total_attempts += u64::from(row.attempt_count);
        if let Some(d) = row.duration() {
            durations
                .entry(row.stage_name.as_str())
                .or_default()
                .push(d.num_milliseconds());
        }
    }

    registry
        .topological_order()
        .iter()
        .map(|name| {
            let mut s = stats.remove(name.as_str()).unwrap_or_default();
            s.stage_name.clone_from(name);
            if let Some(mut d) = durations.remove(name.as_str()) {
                d.sort_unstable();
                #[allow(clippy::cast_precision_loss)]
                let mean = d.iter().sum::<i64>() as f64 / d.len() as f64;
                s.mean_duration_ms = Some(mean);
                s.max_duration_ms = d.last().copied();
                s.p95_duration_ms = percentile(&d, 95);
            }
            s
        })
        .collect()
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[i64], pct: usize) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted.get(rank - 1).copied()
}
