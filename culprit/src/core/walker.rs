//! Revision walker: the bisection state machine over a version history.
//!
//! [`RevisionWalker`] is the seam between the search logic and the history
//! source. An implementation may wrap a version-control tool's own bisection
//! primitive (see `io::git::GitBisectWalker`) or, like [`ListWalker`] here,
//! run binary search directly over an explicit ordered revision list. Both
//! satisfy the same contract and return structured [`MarkOutcome`] variants
//! instead of pattern-matched tool output.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, anyhow};

use crate::core::types::{MarkOutcome, Revision, Verdict};

/// Abstraction over the version history used by a bisection session.
pub trait RevisionWalker {
    /// Begin a search bounded by the two anchors.
    fn start(&mut self, good: &Revision, bad: &Revision) -> Result<()>;

    /// Select (and check out, where a working copy exists) the next
    /// candidate. `None` means no untested candidate remains.
    fn next(&mut self) -> Result<Option<Revision>>;

    /// Record a verdict for a revision and advance the search.
    fn mark(&mut self, revision: &Revision, verdict: Verdict) -> Result<MarkOutcome>;

    /// Terminal outcome once [`RevisionWalker::next`] yields no candidate
    /// (e.g. the anchors were adjacent from the start). An error while
    /// untested candidates remain.
    fn conclude(&self) -> Result<MarkOutcome>;

    /// Discard measurement side effects from the working copy without
    /// abandoning the search state.
    fn restore(&mut self) -> Result<()>;

    /// Abandon the search and leave the history in its pre-search state.
    fn reset(&mut self) -> Result<()>;

    /// Reconstruct a running search from a recorded verdict sequence.
    ///
    /// The default starts fresh and replays every mark. Implementations that
    /// keep their own durable search state (like `git bisect`) override this
    /// to reconcile against it instead of double-applying marks.
    fn resume(
        &mut self,
        good: &Revision,
        bad: &Revision,
        marks: &[(Revision, Verdict)],
    ) -> Result<MarkOutcome>
    where
        Self: Sized,
    {
        self.start(good, bad)?;
        replay_marks(self, marks)
    }
}

/// Re-apply a recorded verdict sequence to a freshly started walker.
///
/// Used for crash recovery (reconstructing a running search from the durable
/// run log) and for transcript replay. Returns the first terminal outcome
/// encountered, or `Continuing` if the sequence leaves the search running.
/// `NeedsDisambiguation` entries are passed over: the recorded sequence
/// already contains the skip that resolved them.
pub fn replay_marks<W: RevisionWalker>(
    walker: &mut W,
    marks: &[(Revision, Verdict)],
) -> Result<MarkOutcome> {
    for (revision, verdict) in marks {
        match walker.mark(revision, *verdict)? {
            MarkOutcome::Continuing | MarkOutcome::NeedsDisambiguation(_) => {}
            terminal => return Ok(terminal),
        }
    }
    Ok(MarkOutcome::Continuing)
}

/// Binary search over an explicit ordered revision list.
///
/// The list is ordered oldest to newest. The search runs strictly between
/// the highest revision known good and the lowest known bad; a revision is
/// never offered twice in one session, and a skip removes the candidate
/// without moving either proven bound.
#[derive(Debug)]
pub struct ListWalker {
    revisions: Vec<Revision>,
    index: HashMap<String, usize>,
    state: Option<SearchState>,
}

#[derive(Debug)]
struct SearchState {
    good_bound: usize,
    bad_bound: usize,
    marked: BTreeSet<usize>,
    skipped: BTreeSet<usize>,
}

impl ListWalker {
    pub fn new(revisions: Vec<Revision>) -> Self {
        let index = revisions
            .iter()
            .enumerate()
            .map(|(i, rev)| (rev.hash.clone(), i))
            .collect();
        Self {
            revisions,
            index,
            state: None,
        }
    }

    fn lookup(&self, revision: &Revision) -> Result<usize> {
        self.index
            .get(&revision.hash)
            .copied()
            .ok_or_else(|| anyhow!("revision {} not in history list", revision.short()))
    }

    fn search(&mut self) -> Result<&mut SearchState> {
        self.state
            .as_mut()
            .ok_or_else(|| anyhow!("walker not started"))
    }

    /// Untested indices strictly between the current bounds.
    fn candidates(state: &SearchState) -> Vec<usize> {
        (state.good_bound + 1..state.bad_bound)
            .filter(|i| !state.marked.contains(i))
            .collect()
    }

    /// Terminal outcome for a state with no untested candidates.
    fn terminal(revisions: &[Revision], state: &SearchState) -> MarkOutcome {
        let skipped_in_range: Vec<usize> = state
            .skipped
            .range(state.good_bound + 1..state.bad_bound)
            .copied()
            .collect();
        if skipped_in_range.is_empty() {
            return MarkOutcome::Culprit(revisions[state.bad_bound].clone());
        }
        let mut suspects: Vec<Revision> = skipped_in_range
            .into_iter()
            .map(|i| revisions[i].clone())
            .collect();
        suspects.push(revisions[state.bad_bound].clone());
        MarkOutcome::Exhausted(suspects)
    }
}

impl RevisionWalker for ListWalker {
    fn start(&mut self, good: &Revision, bad: &Revision) -> Result<()> {
        let gi = self.lookup(good)?;
        let bi = self.lookup(bad)?;
        if gi >= bi {
            return Err(anyhow!(
                "ill-posed search: good anchor {} does not precede bad anchor {}",
                good.short(),
                bad.short()
            ));
        }
        self.state = Some(SearchState {
            good_bound: gi,
            bad_bound: bi,
            marked: BTreeSet::new(),
            skipped: BTreeSet::new(),
        });
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Revision>> {
        let state = self.search()?;
        let candidates = Self::candidates(state);
        if candidates.is_empty() {
            return Ok(None);
        }
        let idx = candidates[candidates.len() / 2];
        Ok(Some(self.revisions[idx].clone()))
    }

    fn mark(&mut self, revision: &Revision, verdict: Verdict) -> Result<MarkOutcome> {
        let idx = self.lookup(revision)?;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("walker not started"))?;
        if state.marked.contains(&idx) {
            return Err(anyhow!(
                "revision {} already marked in this session",
                revision.short()
            ));
        }
        state.marked.insert(idx);
        match verdict {
            Verdict::Good => {
                if idx >= state.bad_bound {
                    return Err(anyhow!(
                        "contradictory verdict: {} marked good above the bad bound",
                        revision.short()
                    ));
                }
                state.good_bound = state.good_bound.max(idx);
            }
            Verdict::Bad => {
                if idx <= state.good_bound {
                    return Err(anyhow!(
                        "contradictory verdict: {} marked bad below the good bound",
                        revision.short()
                    ));
                }
                state.bad_bound = state.bad_bound.min(idx);
            }
            Verdict::Skip => {
                state.skipped.insert(idx);
            }
        }

        if !Self::candidates(state).is_empty() {
            return Ok(MarkOutcome::Continuing);
        }
        Ok(Self::terminal(&self.revisions, state))
    }

    fn conclude(&self) -> Result<MarkOutcome> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| anyhow!("walker not started"))?;
        if !Self::candidates(state).is_empty() {
            return Err(anyhow!("untested candidates remain"));
        }
        Ok(Self::terminal(&self.revisions, state))
    }

    fn restore(&mut self) -> Result<()> {
        // No working copy to restore.
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = None;
        Ok(())
    }
}
