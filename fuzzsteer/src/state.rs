use serde::Serialize;

use crate::strategy::StrategyLabel;
use crate::telemetry::Snapshot;

/// Everything a controller remembers between polls.
///
/// A value is never changed in place; [`RunState::advance`] produces the
/// successor after a successful poll, so a failed poll leaves the previous
/// state untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    pub last_snapshot: Option<Snapshot>,
    pub best_coverage_pct: f64,
    pub best_corpus_count: u64,
    /// Crash count as of the last decision
    pub last_crash_count: u64,
    pub iteration: u64,
    pub current_strategy: StrategyLabel,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            last_snapshot: None,
            best_coverage_pct: 0.0,
            best_corpus_count: 0,
            last_crash_count: 0,
            iteration: 0,
            current_strategy: StrategyLabel::Explore,
        }
    }

    /// Folds a decided snapshot into the state.
    #[must_use]
    pub fn advance(&self, snapshot: Snapshot, strategy: StrategyLabel) -> RunState {
        RunState {
            best_coverage_pct: self.best_coverage_pct.max(snapshot.coverage_pct),
            best_corpus_count: self.best_corpus_count.max(snapshot.corpus_count),
            last_crash_count: snapshot.crash_count,
            iteration: self.iteration + 1,
            current_strategy: strategy,
            last_snapshot: Some(snapshot),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test_log::test]
    fn test_new_state_is_zeroed() {
        let state = RunState::new();
        assert!(state.last_snapshot.is_none());
        assert_eq!(state.best_coverage_pct, 0.0);
        assert_eq!(state.best_corpus_count, 0);
        assert_eq!(state.last_crash_count, 0);
        assert_eq!(state.iteration, 0);
        assert_eq!(state.current_strategy, StrategyLabel::Explore);
    }

    #[test_log::test]
    fn test_best_values_never_decrease() {
        let readings = [(1.0, 10), (3.0, 5), (0.5, 40), (2.0, 39), (2.9, 1)];

        let mut state = RunState::new();
        let mut previous = state.clone();
        for (coverage, corpus) in readings {
            let snapshot = Snapshot::new(coverage, corpus, 0, 1.0, SystemTime::now());
            state = state.advance(snapshot, StrategyLabel::Explore);

            assert!(state.best_coverage_pct >= previous.best_coverage_pct);
            assert!(state.best_corpus_count >= previous.best_corpus_count);
            assert_eq!(state.iteration, previous.iteration + 1);
            previous = state.clone();
        }

        assert_eq!(state.best_coverage_pct, 3.0);
        assert_eq!(state.best_corpus_count, 40);
    }

    #[test_log::test]
    fn test_advance_does_not_touch_predecessor() {
        let state = RunState::new();
        let snapshot = Snapshot::new(1.0, 10, 3, 1.0, SystemTime::now());
        let next = state.advance(snapshot.clone(), StrategyLabel::Exploit);

        assert_eq!(state, RunState::new());
        assert_eq!(next.last_crash_count, 3);
        assert_eq!(next.last_snapshot, Some(snapshot));
        assert_eq!(next.current_strategy, StrategyLabel::Exploit);
    }
}
