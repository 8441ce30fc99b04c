//! Top-level loop: drive a bisection session to its terminal outcome.
//!
//! Strictly sequential: one revision is checked out, built, and measured at
//! a time, and the next step never starts before the previous verdict is
//! durably recorded. The working copy is restored after every step, on both
//! success and failure paths, so measurement side effects never leak from
//! one revision into the next.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::types::{Revision, StepOutcome};
use crate::core::walker::RevisionWalker;
use crate::io::oracle::Oracle;
use crate::session::BisectionSession;

/// Why the driver stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStop {
    CulpritFound(Revision),
    /// Only skipped revisions remain; the culprit is among the suspects.
    Exhausted(Vec<Revision>),
}

/// Summary of a driver invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub steps_executed: u32,
    pub stop: RunStop,
}

/// Run the session to completion, invoking `on_step` after every step.
///
/// Only infrastructure failures cross this boundary as errors; oracle
/// outcomes are already normalized into verdicts by the session. A fatal
/// error is annotated with the last durably recorded revision so the
/// operator can resume manually.
pub fn run<W: RevisionWalker, O: Oracle, F: FnMut(&StepOutcome)>(
    session: &mut BisectionSession<W, O>,
    mut on_step: F,
) -> Result<RunOutcome> {
    let mut steps_executed = 0u32;
    loop {
        let outcome = match session.step() {
            Ok(outcome) => outcome,
            Err(err) => {
                // Leave the history clean even on the failure path.
                if let Err(restore_err) = session.restore_working_copy() {
                    warn!(err = %restore_err, "failed to restore working copy after error");
                }
                let last = last_recorded(session);
                return Err(err).with_context(|| match last {
                    Some(rev) => format!("session aborted (last recorded revision {rev})"),
                    None => "session aborted (nothing recorded yet)".to_string(),
                });
            }
        };
        steps_executed += 1;
        session
            .restore_working_copy()
            .context("restore working copy between steps")?;
        on_step(&outcome);

        match outcome {
            StepOutcome::Continuing { .. } | StepOutcome::NoOracleData { .. } => {}
            StepOutcome::CulpritFound(culprit) => {
                info!(culprit = culprit.short(), steps_executed, "search complete");
                return Ok(RunOutcome {
                    steps_executed,
                    stop: RunStop::CulpritFound(culprit),
                });
            }
            StepOutcome::Exhausted(suspects) => {
                return Ok(RunOutcome {
                    steps_executed,
                    stop: RunStop::Exhausted(suspects),
                });
            }
        }
    }
}

fn last_recorded<W: RevisionWalker, O: Oracle>(
    session: &BisectionSession<W, O>,
) -> Option<Revision> {
    session
        .recorder()
        .load_records()
        .ok()?
        .last()
        .map(|r| r.revision.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{PolicyKind, ReferencePoints};
    use crate::core::walker::ListWalker;
    use crate::io::recorder::RunRecorder;
    use crate::session::SessionParams;
    use crate::test_support::{ScriptedOracle, revision_list};

    fn session_over(
        revisions: &[crate::core::types::Revision],
        state_dir: &std::path::Path,
        metric: impl Fn(usize) -> f64,
    ) -> BisectionSession<ListWalker, ScriptedOracle> {
        BisectionSession::new(
            ListWalker::new(revisions.to_vec()),
            ScriptedOracle::with_metrics(revisions, metric),
            RunRecorder::new(state_dir),
            SessionParams {
                good: revisions[0].clone(),
                bad: revisions[revisions.len() - 1].clone(),
                policy: PolicyKind::Threshold,
                refs: ReferencePoints {
                    good_ref: 300.0,
                    bad_ref: 600.0,
                },
                label: "build-time".to_string(),
                state_path: state_dir.join("session.json"),
            },
        )
        .expect("session")
    }

    #[test]
    fn drives_to_culprit_and_reports_step_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(32);
        let mut session =
            session_over(&revisions, temp.path(), |idx| if idx >= 20 { 620.0 } else { 280.0 });

        let mut seen = 0u32;
        let outcome = run(&mut session, |_| seen += 1).expect("run");
        assert_eq!(outcome.stop, RunStop::CulpritFound(revisions[20].clone()));
        assert_eq!(outcome.steps_executed, seen);
        // Binary search over 30 interior candidates needs at most 5 tests
        // plus the terminal step.
        assert!(outcome.steps_executed <= 6, "took {} steps", outcome.steps_executed);
    }

    #[test]
    fn fatal_error_names_the_last_recorded_revision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(8);
        // The oracle has no script for anything: the very first measurement
        // is an infrastructure failure.
        let mut session = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            ScriptedOracle::new(Default::default()),
            RunRecorder::new(temp.path()),
            SessionParams {
                good: revisions[0].clone(),
                bad: revisions[7].clone(),
                policy: PolicyKind::Threshold,
                refs: ReferencePoints {
                    good_ref: 300.0,
                    bad_ref: 600.0,
                },
                label: "build-time".to_string(),
                state_path: temp.path().join("session.json"),
            },
        )
        .expect("session");

        let err = run(&mut session, |_| {}).unwrap_err();
        assert!(err.to_string().contains("nothing recorded yet"));
    }
}
