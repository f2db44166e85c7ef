use serde::Serialize;

use crate::state::RunState;
use crate::telemetry::Snapshot;

/// Signed change of a new snapshot against what the controller remembers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend {
    /// New coverage minus the best coverage of the run, may be negative
    pub coverage_delta: f64,
    /// New corpus size minus the previous snapshot's, zero on the first poll
    pub corpus_delta: i64,
    /// Crashes found since the last decision, never negative
    pub new_crashes: u64,
    pub coverage_pct: f64,
    pub corpus_count: u64,
}

/// Compares `snapshot` to the run so far. Pure, touches neither argument.
pub fn evaluate(snapshot: &Snapshot, state: &RunState) -> Trend {
    let coverage_pct = snapshot.coverage_pct.max(0.0);
    let corpus_count = snapshot.corpus_count;

    let previous_corpus = state
        .last_snapshot
        .as_ref()
        .map_or(corpus_count, |last| last.corpus_count);

    Trend {
        coverage_delta: coverage_pct - state.best_coverage_pct,
        corpus_delta: signed_difference(corpus_count, previous_corpus),
        new_crashes: snapshot.crash_count.saturating_sub(state.last_crash_count),
        coverage_pct,
        corpus_count,
    }
}

fn signed_difference(new: u64, old: u64) -> i64 {
    if new >= old {
        i64::try_from(new - old).unwrap_or(i64::MAX)
    } else {
        i64::try_from(old - new).map_or(i64::MIN, |d| -d)
    }
}
