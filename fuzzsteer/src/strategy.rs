//! Strategy labels and the rule table that picks one from a trend.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::trend::Trend;

/// The closed set of strategies a controller can recommend.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StrategyLabel {
    #[default]
    Explore,
    Exploit,
    Hybrid,
    Deep,
}

impl StrategyLabel {
    pub const ALL: [StrategyLabel; 4] = [
        StrategyLabel::Explore,
        StrategyLabel::Exploit,
        StrategyLabel::Hybrid,
        StrategyLabel::Deep,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            StrategyLabel::Explore => "explore",
            StrategyLabel::Exploit => "exploit",
            StrategyLabel::Hybrid => "hybrid",
            StrategyLabel::Deep => "deep",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            StrategyLabel::Explore => 0,
            StrategyLabel::Exploit => 1,
            StrategyLabel::Hybrid => 2,
            StrategyLabel::Deep => 3,
        }
    }
}

impl fmt::Display for StrategyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pad() so that width specifiers in status lines work
        f.pad(self.as_str())
    }
}

impl FromStr for StrategyLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyLabel::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown strategy `{}`", s))
    }
}

/// Tunable cut-offs of the selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    /// Coverage gain over the best seen so far, in percentage points, that counts as progress
    pub coverage_gain_pct: f64,
    /// New corpus entries since the previous poll that count as path growth
    pub corpus_growth: i64,
    /// Absolute coverage above which a plateau is considered rich
    pub deep_coverage_pct: f64,
    /// Absolute corpus size above which a plateau is considered rich
    pub deep_corpus_count: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            coverage_gain_pct: 0.5,
            corpus_growth: 20,
            deep_coverage_pct: 2.0,
            deep_corpus_count: 100,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        if !self.coverage_gain_pct.is_finite() || !self.deep_coverage_pct.is_finite() {
            return Err("coverage thresholds must be finite numbers".to_string());
        }
        Ok(())
    }
}

/// Picks exactly one strategy for a trend.
///
/// Rules are checked top to bottom and the first match wins:
///
/// 1. any new crash → [`StrategyLabel::Exploit`]
/// 2. coverage gain above `coverage_gain_pct` → [`StrategyLabel::Explore`]
/// 3. corpus growth above `corpus_growth` → [`StrategyLabel::Hybrid`]
/// 4. coverage above `deep_coverage_pct` and corpus above `deep_corpus_count` → [`StrategyLabel::Deep`]
/// 5. otherwise → [`StrategyLabel::Explore`]
///
/// The order is the tie-break between rules that would match at the same
/// time. Changing it changes which label existing telemetry produces.
pub fn select(trend: &Trend, thresholds: &Thresholds) -> StrategyLabel {
    if trend.new_crashes > 0 {
        StrategyLabel::Exploit
    } else if trend.coverage_delta > thresholds.coverage_gain_pct {
        StrategyLabel::Explore
    } else if trend.corpus_delta > thresholds.corpus_growth {
        StrategyLabel::Hybrid
    } else if trend.coverage_pct > thresholds.deep_coverage_pct
        && trend.corpus_count > thresholds.deep_corpus_count
    {
        StrategyLabel::Deep
    } else {
        StrategyLabel::Explore
    }
}

/// How often each label was selected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StrategyTally {
    counts: [u64; 4],
}

impl StrategyTally {
    pub fn record(&mut self, label: StrategyLabel) {
        self.counts[label.index()] += 1;
    }

    pub fn count(&self, label: StrategyLabel) -> u64 {
        self.counts[label.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl fmt::Display for StrategyTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total();
        for (i, label) in StrategyLabel::ALL.into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let count = self.count(label);
            match total {
                0 => write!(f, "{}: 0", label)?,
                _ => write!(
                    f,
                    "{}: {} ({:.1}%)",
                    label,
                    count,
                    count as f64 * 100.0 / total as f64
                )?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend(coverage_delta: f64, corpus_delta: i64, new_crashes: u64) -> Trend {
        Trend {
            coverage_delta,
            corpus_delta,
            new_crashes,
            coverage_pct: 1.0,
            corpus_count: 10,
        }
    }

    #[test_log::test]
    fn test_crash_beats_every_other_rule() {
        let mut t = trend(5.0, 500, 1);
        t.coverage_pct = 50.0;
        t.corpus_count = 5000;
        assert_eq!(select(&t, &Thresholds::default()), StrategyLabel::Exploit);
    }

    #[test_log::test]
    fn test_coverage_gain_beats_corpus_growth() {
        let t = trend(0.6, 500, 0);
        assert_eq!(select(&t, &Thresholds::default()), StrategyLabel::Explore);
    }

    #[test_log::test]
    fn test_corpus_growth_is_hybrid() {
        let t = trend(0.5, 21, 0);
        assert_eq!(select(&t, &Thresholds::default()), StrategyLabel::Hybrid);
    }

    #[test_log::test]
    fn test_thresholds_are_strict() {
        // exactly at the cut-off is not above it
        let t = trend(0.5, 20, 0);
        assert_eq!(select(&t, &Thresholds::default()), StrategyLabel::Explore);
    }

    #[test_log::test]
    fn test_rich_plateau_is_deep() {
        let mut t = trend(0.0, 1, 0);
        t.coverage_pct = 2.5;
        t.corpus_count = 101;
        assert_eq!(select(&t, &Thresholds::default()), StrategyLabel::Deep);

        t.corpus_count = 100;
        assert_eq!(select(&t, &Thresholds::default()), StrategyLabel::Explore);
    }

    #[test_log::test]
    fn test_tuned_thresholds() {
        let thresholds = Thresholds {
            coverage_gain_pct: 2.0,
            corpus_growth: 5,
            ..Thresholds::default()
        };
        let t = trend(1.0, 6, 0);
        assert_eq!(select(&t, &thresholds), StrategyLabel::Hybrid);
    }

    #[test_log::test]
    fn test_label_round_trip_through_str() {
        for label in StrategyLabel::ALL {
            assert_eq!(label.to_string().parse::<StrategyLabel>(), Ok(label));
        }
        assert_eq!("DEEP".parse::<StrategyLabel>(), Ok(StrategyLabel::Deep));
        assert!("random".parse::<StrategyLabel>().is_err());
    }

    #[test_log::test]
    fn test_tally_distribution() {
        let mut tally = StrategyTally::default();
        tally.record(StrategyLabel::Explore);
        tally.record(StrategyLabel::Explore);
        tally.record(StrategyLabel::Exploit);
        tally.record(StrategyLabel::Deep);

        assert_eq!(tally.total(), 4);
        assert_eq!(tally.count(StrategyLabel::Explore), 2);
        assert_eq!(
            tally.to_string(),
            "explore: 2 (50.0%), exploit: 1 (25.0%), hybrid: 0 (0.0%), deep: 1 (25.0%)"
        );
    }
}
