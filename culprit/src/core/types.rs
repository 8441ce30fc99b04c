//! Shared deterministic types for the bisection core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable identifier for one revision in the history.
///
/// Ordering between revisions is defined only through the underlying history
/// graph, never by comparing hashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision {
    pub hash: String,
}

impl Revision {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }

    /// Short display form (at most 12 hex characters).
    pub fn short(&self) -> &str {
        let len = self.hash.len().min(12);
        &self.hash[..len]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

/// Judgement applied to a tested revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Good,
    Bad,
    Skip,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Good => "good",
            Verdict::Bad => "bad",
            Verdict::Skip => "skip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good" => Some(Verdict::Good),
            "bad" => Some(Verdict::Bad),
            "skip" => Some(Verdict::Skip),
            _ => None,
        }
    }
}

/// Outcome classification of one oracle attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleStatus {
    /// The measurement ran to completion and produced a metric.
    Ok,
    /// The measurement ran and failed (expected, recoverable).
    Fail,
    /// The revision could not be meaningfully evaluated (untestable).
    Inconclusive,
}

/// Normalized result of one external measurement attempt.
///
/// Invariant: `metric` is present iff `status == Ok`. Use the constructors;
/// they enforce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleResult {
    pub status: OracleStatus,
    pub metric: Option<f64>,
    pub diagnostics: String,
}

impl OracleResult {
    pub fn ok(metric: f64, diagnostics: impl Into<String>) -> Self {
        Self {
            status: OracleStatus::Ok,
            metric: Some(metric),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn fail(diagnostics: impl Into<String>) -> Self {
        Self {
            status: OracleStatus::Fail,
            metric: None,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn inconclusive(diagnostics: impl Into<String>) -> Self {
        Self {
            status: OracleStatus::Inconclusive,
            metric: None,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Structured result of marking a revision, replacing pattern matching on
/// version-control tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    /// Search continues; a new candidate is available.
    Continuing,
    /// The first bad revision has been isolated.
    Culprit(Revision),
    /// The candidate is a history merge point whose parents need verdicts;
    /// resolved by marking it skip and continuing, never by failing.
    NeedsDisambiguation(Revision),
    /// Only skipped revisions separate the bounds; the culprit is one of
    /// these but cannot be isolated further.
    Exhausted(Vec<Revision>),
}

/// Result of one [`crate::session::BisectionSession::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A revision was tested and the search advanced.
    Continuing { revision: Revision, verdict: Verdict },
    /// A revision was excluded without oracle data (untestable or ambiguous).
    NoOracleData { revision: Revision },
    /// Terminal: the culprit has been isolated.
    CulpritFound(Revision),
    /// Terminal: the search space is exhausted (only skips remain).
    Exhausted(Vec<Revision>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_revision_truncates_to_twelve() {
        let rev = Revision::new("0123456789abcdef0123456789abcdef01234567");
        assert_eq!(rev.short(), "0123456789ab");
    }

    #[test]
    fn short_revision_handles_short_hashes() {
        let rev = Revision::new("abc123");
        assert_eq!(rev.short(), "abc123");
    }

    #[test]
    fn verdict_round_trips_through_str() {
        for v in [Verdict::Good, Verdict::Bad, Verdict::Skip] {
            assert_eq!(Verdict::parse(v.as_str()), Some(v));
        }
        assert_eq!(Verdict::parse("meh"), None);
    }

    #[test]
    fn oracle_result_constructors_enforce_metric_invariant() {
        assert_eq!(OracleResult::ok(1.5, "t").metric, Some(1.5));
        assert_eq!(OracleResult::fail("boom").metric, None);
        assert_eq!(OracleResult::inconclusive("missing").metric, None);
    }
}
