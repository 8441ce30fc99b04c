//! Verdict policies: pure mapping from an oracle result to a bisection verdict.
//!
//! Two variants cover the two kinds of regression hunt: the binary policy
//! answers "did the structural capability regress" (e.g. does installation
//! succeed at all), the threshold policy answers "is the regression's
//! magnitude present" by comparing a scalar metric against the midpoint of
//! the two anchor measurements.

use serde::{Deserialize, Serialize};

use crate::core::types::{OracleResult, OracleStatus, Verdict};

/// Which decision rule to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// ok -> bad, fail -> good, inconclusive -> skip.
    Binary,
    /// Compare the metric against the midpoint of the anchor references.
    Threshold,
}

/// Static reference measurements for the two anchors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoints {
    pub good_ref: f64,
    pub bad_ref: f64,
}

impl ReferencePoints {
    pub fn midpoint(&self) -> f64 {
        (self.good_ref + self.bad_ref) / 2.0
    }
}

/// Map an oracle result to a verdict.
///
/// `Inconclusive` always maps to `Skip`, never to `Good`/`Bad`. Under the
/// threshold policy, equality with the midpoint yields `Good` (inclusive
/// lower bound): ties push the search toward newer revisions. A `Fail` under
/// the threshold policy also yields `Skip`, since a failed run produces no
/// metric to compare.
pub fn decide(kind: PolicyKind, result: &OracleResult, refs: &ReferencePoints) -> Verdict {
    match (kind, result.status) {
        (_, OracleStatus::Inconclusive) => Verdict::Skip,
        (PolicyKind::Binary, OracleStatus::Ok) => Verdict::Bad,
        (PolicyKind::Binary, OracleStatus::Fail) => Verdict::Good,
        (PolicyKind::Threshold, OracleStatus::Fail) => Verdict::Skip,
        (PolicyKind::Threshold, OracleStatus::Ok) => {
            // Constructors guarantee a metric when status is Ok.
            let metric = result.metric.unwrap_or(f64::INFINITY);
            if metric <= refs.midpoint() {
                Verdict::Good
            } else {
                Verdict::Bad
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFS: ReferencePoints = ReferencePoints {
        good_ref: 300.0,
        bad_ref: 600.0,
    };

    #[test]
    fn binary_maps_ok_to_bad_regardless_of_metric() {
        let result = OracleResult::ok(1.0, "");
        assert_eq!(decide(PolicyKind::Binary, &result, &REFS), Verdict::Bad);
    }

    #[test]
    fn binary_maps_fail_to_good() {
        let result = OracleResult::fail("install exploded");
        assert_eq!(decide(PolicyKind::Binary, &result, &REFS), Verdict::Good);
    }

    #[test]
    fn inconclusive_always_skips() {
        let result = OracleResult::inconclusive("config missing");
        assert_eq!(decide(PolicyKind::Binary, &result, &REFS), Verdict::Skip);
        assert_eq!(decide(PolicyKind::Threshold, &result, &REFS), Verdict::Skip);
    }

    /// Scenario A: anchors 300/600, a 280s measurement is good, 620s is bad.
    #[test]
    fn threshold_splits_around_midpoint() {
        let fast = OracleResult::ok(280.0, "");
        let slow = OracleResult::ok(620.0, "");
        assert_eq!(decide(PolicyKind::Threshold, &fast, &REFS), Verdict::Good);
        assert_eq!(decide(PolicyKind::Threshold, &slow, &REFS), Verdict::Bad);
    }

    #[test]
    fn threshold_tie_favors_good() {
        let at_midpoint = OracleResult::ok(450.0, "");
        assert_eq!(
            decide(PolicyKind::Threshold, &at_midpoint, &REFS),
            Verdict::Good
        );
        let just_over = OracleResult::ok(450.0001, "");
        assert_eq!(
            decide(PolicyKind::Threshold, &just_over, &REFS),
            Verdict::Bad
        );
    }

    #[test]
    fn threshold_fail_skips() {
        let result = OracleResult::fail("build failed");
        assert_eq!(decide(PolicyKind::Threshold, &result, &REFS), Verdict::Skip);
    }
}
