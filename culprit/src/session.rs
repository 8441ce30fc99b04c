//! Orchestration for a single bisection session.
//!
//! [`BisectionSession::step`] is the unit of crash recovery. The ordering is
//! strict: the pending candidate is persisted before the oracle runs, the
//! verdict record is appended before the walker advances, and the pending
//! watermark is cleared only after the mark succeeded. A process restart at
//! any point re-derives its position from the run log plus the walker's own
//! state; no revision is ever silently skipped without a recorded reason.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::policy::{PolicyKind, ReferencePoints, decide};
use crate::core::types::{MarkOutcome, Revision, StepOutcome, Verdict};
use crate::core::walker::RevisionWalker;
use crate::io::oracle::Oracle;
use crate::io::recorder::{RecordKind, RunRecorder, Transcript, TranscriptMark, VerdictRecord};
use crate::io::session_state::{
    SessionPhase, SessionState, load_session_state, write_session_state,
};

/// Static parameters of one session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub good: Revision,
    pub bad: Revision,
    pub policy: PolicyKind,
    pub refs: ReferencePoints,
    pub label: String,
    pub state_path: PathBuf,
}

/// One bisection session: walker + policy + oracle + durable records.
pub struct BisectionSession<W: RevisionWalker, O: Oracle> {
    walker: W,
    oracle: O,
    recorder: RunRecorder,
    params: SessionParams,
    state: SessionState,
    attached: bool,
}

impl<W: RevisionWalker, O: Oracle> BisectionSession<W, O> {
    pub fn new(walker: W, oracle: O, recorder: RunRecorder, params: SessionParams) -> Result<Self> {
        if params.good == params.bad {
            return Err(anyhow!("ill-posed search: good and bad anchors are equal"));
        }
        let state = load_session_state(&params.state_path)?;
        if state.phase != SessionPhase::NotStarted
            && !state.matches_anchors(&params.good, &params.bad)
        {
            return Err(anyhow!(
                "existing session state is for different anchors (good {:?}, bad {:?}); \
                 reset the state directory to start over",
                state.good.as_ref().map(Revision::short),
                state.bad.as_ref().map(Revision::short),
            ));
        }
        Ok(Self {
            walker,
            oracle,
            recorder,
            params,
            state,
            attached: false,
        })
    }

    pub fn recorder(&self) -> &RunRecorder {
        &self.recorder
    }

    /// Discard working-copy side effects of the last step.
    pub fn restore_working_copy(&mut self) -> Result<()> {
        self.walker.restore()
    }

    /// Abandon the search and clean up walker state.
    pub fn abandon(&mut self) -> Result<()> {
        self.walker.reset()
    }

    /// Execute one step of the search.
    #[instrument(skip_all)]
    pub fn step(&mut self) -> Result<StepOutcome> {
        if let Some(terminal) = self.attach()? {
            return self.complete(terminal);
        }

        let candidate = match self.state.pending.clone() {
            Some(pending) => {
                debug!(rev = pending.short(), "resuming pending candidate");
                pending
            }
            None => match self.walker.next()? {
                Some(candidate) => {
                    self.state.pending = Some(candidate.clone());
                    self.persist()?;
                    candidate
                }
                None => {
                    let terminal = self.walker.conclude()?;
                    return self.complete(terminal);
                }
            },
        };

        // Crash recovery: a verdict already recorded for the pending
        // candidate is re-applied without re-running the oracle.
        let verdict = match self.recorder.verdict_for(&candidate)? {
            Some(recorded) => {
                info!(rev = candidate.short(), verdict = recorded.as_str(),
                    "re-applying recorded verdict");
                recorded
            }
            None => {
                let result = self.oracle.measure(&candidate)?;
                let verdict = decide(self.params.policy, &result, &self.params.refs);
                info!(rev = candidate.short(), status = ?result.status,
                    metric = ?result.metric, verdict = verdict.as_str(), "measured");
                self.recorder.append(&VerdictRecord {
                    timestamp: Utc::now(),
                    revision: candidate.clone(),
                    label: self.params.label.clone(),
                    kind: RecordKind::Verdict(verdict),
                    metric: result.metric,
                })?;
                verdict
            }
        };

        let mut outcome = self.walker.mark(&candidate, verdict)?;
        // A merge point cannot be judged by a single measurement; exclude it
        // explicitly (with a durable record) and continue.
        while let MarkOutcome::NeedsDisambiguation(merge_point) = outcome {
            warn!(rev = merge_point.short(), "merge point needs disambiguation, skipping");
            self.recorder.append(&VerdictRecord {
                timestamp: Utc::now(),
                revision: merge_point.clone(),
                label: self.params.label.clone(),
                kind: RecordKind::Verdict(Verdict::Skip),
                metric: None,
            })?;
            outcome = self.walker.mark(&merge_point, Verdict::Skip)?;
        }

        self.state.pending = None;
        self.persist()?;

        match outcome {
            MarkOutcome::Continuing => {
                if verdict == Verdict::Skip {
                    Ok(StepOutcome::NoOracleData {
                        revision: candidate,
                    })
                } else {
                    Ok(StepOutcome::Continuing {
                        revision: candidate,
                        verdict,
                    })
                }
            }
            terminal => self.complete(terminal),
        }
    }

    /// Start or resume the walker on the first `step()` of this process.
    /// Returns a terminal outcome if the recorded history already finishes
    /// the search.
    fn attach(&mut self) -> Result<Option<MarkOutcome>> {
        if self.attached {
            return Ok(None);
        }
        match self.state.phase {
            SessionPhase::NotStarted => {
                self.walker.start(&self.params.good, &self.params.bad)?;
                self.state = SessionState {
                    phase: SessionPhase::Running,
                    good: Some(self.params.good.clone()),
                    bad: Some(self.params.bad.clone()),
                    pending: None,
                };
                self.persist()?;
                self.attached = true;
                Ok(None)
            }
            SessionPhase::Running => {
                let marks = self.recorder.verdict_marks()?;
                debug!(recorded_marks = marks.len(), "resuming session from run log");
                let outcome =
                    self.walker
                        .resume(&self.params.good, &self.params.bad, &marks)?;
                // A pending candidate whose verdict is already in the log was
                // marked during replay; clear the watermark.
                if let Some(pending) = &self.state.pending
                    && marks.iter().any(|(rev, _)| rev == pending)
                {
                    self.state.pending = None;
                    self.persist()?;
                }
                self.attached = true;
                match outcome {
                    MarkOutcome::Continuing | MarkOutcome::NeedsDisambiguation(_) => Ok(None),
                    terminal => Ok(Some(terminal)),
                }
            }
            SessionPhase::Complete => Err(anyhow!(
                "session already complete; reset the state directory to start over"
            )),
        }
    }

    /// Record the terminal outcome and close the session.
    fn complete(&mut self, terminal: MarkOutcome) -> Result<StepOutcome> {
        let outcome = match terminal {
            MarkOutcome::Culprit(culprit) => {
                self.finalize_culprit(&culprit)?;
                StepOutcome::CulpritFound(culprit)
            }
            MarkOutcome::Exhausted(suspects) => {
                warn!(suspects = suspects.len(), "search space exhausted");
                StepOutcome::Exhausted(suspects)
            }
            other => {
                return Err(anyhow!("walker returned non-terminal outcome {other:?}"));
            }
        };
        self.state.pending = None;
        self.state.phase = SessionPhase::Complete;
        self.persist()?;
        Ok(outcome)
    }

    fn finalize_culprit(&mut self, culprit: &Revision) -> Result<()> {
        let already_final = self
            .recorder
            .load_records()?
            .iter()
            .any(|r| r.kind == RecordKind::Culprit);
        if already_final {
            return Ok(());
        }
        info!(culprit = culprit.short(), "culprit isolated");
        self.recorder
            .finalize(&self.params.label, culprit, Utc::now())?;
        let marks = self
            .recorder
            .verdict_marks()?
            .into_iter()
            .map(|(revision, verdict)| TranscriptMark { revision, verdict })
            .collect();
        self.recorder.write_transcript(&Transcript {
            good: self.params.good.clone(),
            bad: self.params.bad.clone(),
            marks,
            culprit: culprit.clone(),
        })
    }

    fn persist(&self) -> Result<()> {
        write_session_state(&self.params.state_path, &self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    use crate::core::types::OracleResult;
    use crate::core::walker::ListWalker;
    use crate::test_support::{ScriptedOracle, revision_list};

    const REFS: ReferencePoints = ReferencePoints {
        good_ref: 300.0,
        bad_ref: 600.0,
    };

    fn params(revisions: &[Revision], state_dir: &std::path::Path, policy: PolicyKind) -> SessionParams {
        SessionParams {
            good: revisions[0].clone(),
            bad: revisions[revisions.len() - 1].clone(),
            policy,
            refs: REFS,
            label: "build-time".to_string(),
            state_path: state_dir.join("session.json"),
        }
    }

    fn run_to_terminal<W: RevisionWalker, O: Oracle>(
        session: &mut BisectionSession<W, O>,
    ) -> StepOutcome {
        loop {
            match session.step().expect("step") {
                StepOutcome::Continuing { .. } | StepOutcome::NoOracleData { .. } => {}
                terminal => return terminal,
            }
        }
    }

    /// Threshold hunt: regression lands at rev06 (metric jumps past the
    /// midpoint); the session isolates it and writes log + transcript.
    #[test]
    fn threshold_session_isolates_culprit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(10);
        let oracle = ScriptedOracle::with_metrics(&revisions, |idx| {
            if idx >= 6 { 620.0 } else { 280.0 }
        });
        let recorder = RunRecorder::new(temp.path());
        let mut session = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            oracle,
            recorder.clone(),
            params(&revisions, temp.path(), PolicyKind::Threshold),
        )
        .expect("session");

        let outcome = run_to_terminal(&mut session);
        assert_eq!(outcome, StepOutcome::CulpritFound(revisions[6].clone()));

        let records = recorder.load_records().expect("records");
        assert!(records.iter().any(|r| r.kind == RecordKind::Culprit));
        let transcript = recorder.load_transcript().expect("transcript");
        assert_eq!(transcript.culprit, revisions[6]);
    }

    /// Scenario B: under the binary policy a failing oracle marks the
    /// revision good, and it is never measured again.
    #[test]
    fn binary_session_never_remeasures_a_revision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(12);
        let calls: RefCell<HashMap<String, u32>> = RefCell::new(HashMap::new());
        let revs_for_oracle = revisions.clone();
        let oracle = crate::test_support::FnOracle::new(move |rev: &Revision| {
            *calls.borrow_mut().entry(rev.hash.clone()).or_insert(0) += 1;
            assert_eq!(calls.borrow()[&rev.hash], 1, "revision {rev} measured twice");
            let idx = revs_for_oracle.iter().position(|r| r == rev).expect("known rev");
            if idx >= 8 {
                Ok(OracleResult::ok(1.0, "runs"))
            } else {
                Ok(OracleResult::fail("install exploded"))
            }
        });
        let recorder = RunRecorder::new(temp.path());
        let mut session = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            oracle,
            recorder,
            params(&revisions, temp.path(), PolicyKind::Binary),
        )
        .expect("session");

        let outcome = run_to_terminal(&mut session);
        assert_eq!(outcome, StepOutcome::CulpritFound(revisions[8].clone()));
    }

    /// Scenario C: an untestable revision yields NoOracleData and the walker
    /// proceeds to a sibling.
    #[test]
    fn untestable_revision_is_skipped_with_a_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(8);
        let untestable = revisions[4].clone();
        let revs_for_oracle = revisions.clone();
        let inconclusive_rev = untestable.clone();
        let oracle = crate::test_support::FnOracle::new(move |rev: &Revision| {
            if *rev == inconclusive_rev {
                return Ok(OracleResult::inconclusive("config missing"));
            }
            let idx = revs_for_oracle.iter().position(|r| r == rev).expect("known rev");
            Ok(if idx >= 6 {
                OracleResult::ok(620.0, "")
            } else {
                OracleResult::ok(280.0, "")
            })
        });
        let recorder = RunRecorder::new(temp.path());
        let mut session = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            oracle,
            recorder.clone(),
            params(&revisions, temp.path(), PolicyKind::Threshold),
        )
        .expect("session");

        // rev04 is the first candidate (midpoint of rev01..rev06).
        let first = session.step().expect("step");
        assert_eq!(
            first,
            StepOutcome::NoOracleData {
                revision: untestable.clone()
            }
        );

        let outcome = run_to_terminal(&mut session);
        assert_eq!(outcome, StepOutcome::CulpritFound(revisions[6].clone()));

        // The exclusion is auditable.
        let marks = recorder.verdict_marks().expect("marks");
        assert!(marks.contains(&(untestable, Verdict::Skip)));
    }

    /// Walker that reports a merge point after the first regular mark, to
    /// exercise the disambiguation path without a real merged history.
    struct MergePointWalker {
        inner: ListWalker,
        merge_point: Revision,
        reported: bool,
    }

    impl RevisionWalker for MergePointWalker {
        fn start(&mut self, good: &Revision, bad: &Revision) -> Result<()> {
            self.inner.start(good, bad)
        }

        fn next(&mut self) -> Result<Option<Revision>> {
            self.inner.next()
        }

        fn mark(&mut self, revision: &Revision, verdict: Verdict) -> Result<MarkOutcome> {
            let outcome = self.inner.mark(revision, verdict)?;
            if !self.reported && *revision != self.merge_point {
                self.reported = true;
                return Ok(MarkOutcome::NeedsDisambiguation(self.merge_point.clone()));
            }
            Ok(outcome)
        }

        fn conclude(&self) -> Result<MarkOutcome> {
            self.inner.conclude()
        }

        fn restore(&mut self) -> Result<()> {
            self.inner.restore()
        }

        fn reset(&mut self) -> Result<()> {
            self.inner.reset()
        }
    }

    /// A merge point surfaced mid-step is excluded with a durable skip
    /// record and the search continues to the culprit.
    #[test]
    fn merge_point_is_skipped_with_a_record_and_search_continues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(8);
        let merge_point = revisions[1].clone();
        let walker = MergePointWalker {
            inner: ListWalker::new(revisions.clone()),
            merge_point: merge_point.clone(),
            reported: false,
        };
        let oracle = ScriptedOracle::with_metrics(&revisions, |idx| {
            if idx >= 6 { 620.0 } else { 280.0 }
        });
        let recorder = RunRecorder::new(temp.path());
        let mut session = BisectionSession::new(
            walker,
            oracle,
            recorder.clone(),
            params(&revisions, temp.path(), PolicyKind::Threshold),
        )
        .expect("session");

        // The first step resolves the merge point internally and still
        // reports the tested candidate's verdict.
        let first = session.step().expect("step");
        assert_eq!(
            first,
            StepOutcome::Continuing {
                revision: revisions[4].clone(),
                verdict: Verdict::Good,
            }
        );

        let outcome = run_to_terminal(&mut session);
        assert_eq!(outcome, StepOutcome::CulpritFound(revisions[6].clone()));

        // The exclusion is auditable: a metric-less skip record exists for
        // the merge point, never measured by the oracle.
        let records = recorder.load_records().expect("records");
        let merge_record = records
            .iter()
            .find(|r| r.revision == merge_point)
            .expect("merge point record");
        assert_eq!(merge_record.kind, RecordKind::Verdict(Verdict::Skip));
        assert_eq!(merge_record.metric, None);
    }

    /// Scenario D / resumability: a fresh session over the same log resumes
    /// within the remaining interval and finds the same culprit.
    #[test]
    fn restarted_session_reproduces_the_culprit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(16);
        let metric = |idx: usize| if idx >= 11 { 620.0 } else { 280.0 };

        let recorder = RunRecorder::new(temp.path());
        let mut first = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            ScriptedOracle::with_metrics(&revisions, metric),
            recorder.clone(),
            params(&revisions, temp.path(), PolicyKind::Threshold),
        )
        .expect("session");

        // Crash after two steps.
        for _ in 0..2 {
            match first.step().expect("step") {
                StepOutcome::Continuing { .. } | StepOutcome::NoOracleData { .. } => {}
                other => panic!("terminated early: {other:?}"),
            }
        }
        let marks_before = recorder.verdict_marks().expect("marks").len();
        drop(first);

        let mut resumed = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            ScriptedOracle::with_metrics(&revisions, metric),
            recorder.clone(),
            params(&revisions, temp.path(), PolicyKind::Threshold),
        )
        .expect("resumed session");

        let outcome = run_to_terminal(&mut resumed);
        assert_eq!(outcome, StepOutcome::CulpritFound(revisions[11].clone()));

        // Prior marks were replayed, not repeated: the log keeps growing
        // strictly past the pre-crash prefix.
        let marks_after = recorder.verdict_marks().expect("marks").len();
        assert!(marks_after > marks_before);
    }

    /// Crash between record append and walker mark: the verdict is
    /// re-applied from the log without calling the oracle again.
    #[test]
    fn pending_candidate_with_recorded_verdict_skips_the_oracle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(8);
        let recorder = RunRecorder::new(temp.path());
        let p = params(&revisions, temp.path(), PolicyKind::Threshold);

        // Simulate the crash artifacts: state says rev04 is pending, and its
        // verdict is already durably recorded.
        write_session_state(
            &p.state_path,
            &SessionState {
                phase: SessionPhase::Running,
                good: Some(p.good.clone()),
                bad: Some(p.bad.clone()),
                pending: Some(revisions[4].clone()),
            },
        )
        .expect("state");
        recorder
            .append(&VerdictRecord {
                timestamp: Utc::now(),
                revision: revisions[4].clone(),
                label: "build-time".to_string(),
                kind: RecordKind::Verdict(Verdict::Good),
                metric: Some(280.0),
            })
            .expect("append");

        // An oracle that refuses to measure rev04 proves it is not re-run.
        let forbidden = revisions[4].clone();
        let revs_for_oracle = revisions.clone();
        let oracle = crate::test_support::FnOracle::new(move |rev: &Revision| {
            assert_ne!(*rev, forbidden, "oracle re-ran a recorded revision");
            let idx = revs_for_oracle.iter().position(|r| r == rev).expect("known rev");
            Ok(if idx >= 6 {
                OracleResult::ok(620.0, "")
            } else {
                OracleResult::ok(280.0, "")
            })
        });

        let mut session = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            oracle,
            recorder,
            p,
        )
        .expect("session");
        let outcome = run_to_terminal(&mut session);
        assert_eq!(outcome, StepOutcome::CulpritFound(revisions[6].clone()));
    }

    #[test]
    fn completed_session_refuses_further_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(4);
        let recorder = RunRecorder::new(temp.path());
        let oracle = ScriptedOracle::with_metrics(&revisions, |idx| {
            if idx >= 2 { 620.0 } else { 280.0 }
        });
        let mut session = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            oracle,
            recorder.clone(),
            params(&revisions, temp.path(), PolicyKind::Threshold),
        )
        .expect("session");
        run_to_terminal(&mut session);
        drop(session);

        let mut reopened = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            ScriptedOracle::with_metrics(&revisions, |_| 0.0),
            recorder,
            params(&revisions, temp.path(), PolicyKind::Threshold),
        )
        .expect("session");
        let err = reopened.step().unwrap_err();
        assert!(err.to_string().contains("already complete"));
    }

    #[test]
    fn mismatched_anchors_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let revisions = revision_list(6);
        let p = params(&revisions, temp.path(), PolicyKind::Threshold);
        write_session_state(
            &p.state_path,
            &SessionState {
                phase: SessionPhase::Running,
                good: Some(Revision::new("other-good")),
                bad: Some(Revision::new("other-bad")),
                pending: None,
            },
        )
        .expect("state");

        let err = BisectionSession::new(
            ListWalker::new(revisions.clone()),
            ScriptedOracle::with_metrics(&revisions, |_| 0.0),
            RunRecorder::new(temp.path()),
            p,
        )
        .map(|_| ())
        .unwrap_err();
        assert!(err.to_string().contains("different anchors"));
    }
}
