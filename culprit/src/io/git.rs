//! Git adapter: history source operations and the `git bisect` walker.
//!
//! The engine treats the history as a single shared working copy, so we keep
//! a small, explicit wrapper around `git` subprocess calls. The bisect
//! walker translates git's human-oriented bisect output into structured
//! [`MarkOutcome`] variants; no matched strings leak past this module.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::{MarkOutcome, Revision, Verdict};
use crate::core::walker::RevisionWalker;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve a revision expression to its full hash.
    pub fn rev_parse(&self, rev: &str) -> Result<Revision> {
        let out = self.run_capture(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(Revision::new(out.trim().to_string()))
    }

    /// Currently checked-out revision.
    pub fn current_revision(&self) -> Result<Revision> {
        self.rev_parse("HEAD")
    }

    /// Check out a specific revision (detached).
    #[instrument(skip_all, fields(rev = revision.short()))]
    pub fn checkout(&self, revision: &Revision) -> Result<()> {
        debug!("checking out revision");
        self.run_checked(&["checkout", "--detach", "--quiet", &revision.hash])?;
        Ok(())
    }

    /// Ordered revisions from `good` (exclusive) to `bad` (inclusive),
    /// oldest first.
    pub fn revisions_between(&self, good: &Revision, bad: &Revision) -> Result<Vec<Revision>> {
        let range = format!("{}..{}", good.hash, bad.hash);
        let out = self.run_capture(&["rev-list", "--reverse", &range])?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Revision::new(l.trim().to_string()))
            .collect())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Discard tracked modifications and untracked files, keeping paths under
    /// `keep_prefix` (the engine's own state directory).
    #[instrument(skip_all)]
    pub fn restore_worktree(&self, keep_prefix: &str) -> Result<()> {
        debug!(keep_prefix, "restoring working copy");
        self.run_checked(&["checkout", "--quiet", "--", "."])?;
        let exclude = format!("{keep_prefix}*");
        self.run_checked(&["clean", "-fdq", "-e", &exclude])?;
        Ok(())
    }

    /// True if a bisection is in flight in this repository.
    pub fn bisect_in_progress(&self) -> bool {
        self.workdir.join(".git").join("BISECT_LOG").is_file()
    }

    fn bisect_start(&self, bad: &Revision, good: &Revision) -> Result<String> {
        self.run_capture(&["bisect", "start", &bad.hash, &good.hash])
    }

    fn bisect_mark(&self, verdict: Verdict) -> Result<String> {
        self.run_capture(&["bisect", verdict.as_str()])
    }

    fn bisect_mark_rev(&self, verdict: Verdict, revision: &Revision) -> Result<String> {
        self.run_capture(&["bisect", verdict.as_str(), &revision.hash])
    }

    /// Revisions git's own bisect log has already marked.
    fn bisect_marked_revs(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["bisect", "log"])?;
        Ok(parse_bisect_log_revs(&out))
    }

    fn bisect_reset(&self) -> Result<()> {
        self.run_checked(&["bisect", "reset"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// [`RevisionWalker`] backed by `git bisect`.
///
/// Candidate selection and checkout are git's: after `start` and after each
/// `mark`, HEAD sits on the revision to test. Bisect state lives in `.git`,
/// so a restarted process resumes where git left off.
#[derive(Debug)]
pub struct GitBisectWalker {
    git: Git,
    state_prefix: String,
    terminal: Option<MarkOutcome>,
}

impl GitBisectWalker {
    pub fn new(git: Git, state_prefix: impl Into<String>) -> Self {
        Self {
            git,
            state_prefix: state_prefix.into(),
            terminal: None,
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Classify `git bisect` output into a structured outcome.
    fn classify(&self, output: &str) -> Result<MarkOutcome> {
        if let Some(line) = output
            .lines()
            .find(|l| l.contains("is the first bad commit"))
        {
            let hash = line
                .split_whitespace()
                .next()
                .filter(|tok| is_full_hash(tok))
                .ok_or_else(|| anyhow!("unparseable culprit line: '{line}'"))?;
            return Ok(MarkOutcome::Culprit(Revision::new(hash.to_string())));
        }
        if output.contains("merge base") && output.contains("must be tested") {
            // Git has checked out the merge base; it needs its own verdict
            // before the search can proceed.
            let candidate = self.git.current_revision()?;
            return Ok(MarkOutcome::NeedsDisambiguation(candidate));
        }
        if output.contains("only skipped commits left") {
            let suspects = output
                .lines()
                .map(str::trim)
                .filter(|l| is_full_hash(l))
                .map(|l| Revision::new(l.to_string()))
                .collect();
            return Ok(MarkOutcome::Exhausted(suspects));
        }
        Ok(MarkOutcome::Continuing)
    }
}

fn is_full_hash(token: &str) -> bool {
    token.len() == 40 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// Extract marked revisions from `git bisect log` output
/// (lines of the form `git bisect good <sha>`).
fn parse_bisect_log_revs(log: &str) -> Vec<String> {
    log.lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("git bisect ")?;
            let (action, sha) = rest.split_once(' ')?;
            if !matches!(action, "good" | "bad" | "skip") {
                return None;
            }
            let sha = sha.trim().trim_matches('\'');
            is_full_hash(sha).then(|| sha.to_string())
        })
        .collect()
}

impl RevisionWalker for GitBisectWalker {
    #[instrument(skip_all, fields(good = good.short(), bad = bad.short()))]
    fn start(&mut self, good: &Revision, bad: &Revision) -> Result<()> {
        if good == bad {
            return Err(anyhow!("ill-posed search: good and bad anchors are equal"));
        }
        if self.git.bisect_in_progress() {
            debug!("bisection already in flight, resuming git state");
            return Ok(());
        }
        let output = self.git.bisect_start(bad, good).context("git bisect start")?;
        // Adjacent anchors produce the culprit at start.
        match self.classify(&output)? {
            MarkOutcome::Continuing => {}
            terminal => self.terminal = Some(terminal),
        }
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Revision>> {
        if self.terminal.is_some() {
            return Ok(None);
        }
        if !self.git.bisect_in_progress() {
            return Err(anyhow!("no bisection in progress (walker not started)"));
        }
        let candidate = self.git.current_revision()?;
        Ok(Some(candidate))
    }

    #[instrument(skip_all, fields(rev = revision.short(), verdict = verdict.as_str()))]
    fn mark(&mut self, revision: &Revision, verdict: Verdict) -> Result<MarkOutcome> {
        let current = self.git.current_revision()?;
        if current != *revision {
            return Err(anyhow!(
                "cannot mark {}: working copy is at {}",
                revision.short(),
                current.short()
            ));
        }
        let output = self.git.bisect_mark(verdict).context("git bisect mark")?;
        let outcome = self.classify(&output)?;
        if !matches!(
            outcome,
            MarkOutcome::Continuing | MarkOutcome::NeedsDisambiguation(_)
        ) {
            self.terminal = Some(outcome.clone());
        }
        debug!(?outcome, "bisect advanced");
        Ok(outcome)
    }

    fn conclude(&self) -> Result<MarkOutcome> {
        self.terminal
            .clone()
            .ok_or_else(|| anyhow!("bisection has not reached a terminal state"))
    }

    fn restore(&mut self) -> Result<()> {
        self.git.restore_worktree(&self.state_prefix)
    }

    fn reset(&mut self) -> Result<()> {
        if self.git.bisect_in_progress() {
            self.git.bisect_reset()?;
        }
        self.terminal = None;
        self.git.restore_worktree(&self.state_prefix)
    }

    /// Reconcile against git's own durable bisect state: apply only the
    /// recorded marks git has not seen yet (a crash can lose at most the
    /// last one), instead of replaying from scratch.
    fn resume(
        &mut self,
        good: &Revision,
        bad: &Revision,
        marks: &[(Revision, Verdict)],
    ) -> Result<MarkOutcome> {
        if !self.git.bisect_in_progress() {
            self.start(good, bad)?;
            if let Some(terminal) = &self.terminal {
                return Ok(terminal.clone());
            }
            return crate::core::walker::replay_marks(self, marks);
        }
        let applied = self.git.bisect_marked_revs()?;
        let mut outcome = MarkOutcome::Continuing;
        for (revision, verdict) in marks {
            if applied.iter().any(|sha| *sha == revision.hash) {
                continue;
            }
            debug!(rev = revision.short(), "re-applying recorded mark to git state");
            let output = self.git.bisect_mark_rev(*verdict, revision)?;
            let classified = self.classify(&output)?;
            match classified {
                MarkOutcome::Continuing | MarkOutcome::NeedsDisambiguation(_) => {}
                terminal => {
                    self.terminal = Some(terminal.clone());
                    outcome = terminal;
                    break;
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHistory;

    #[test]
    fn revisions_between_excludes_good_includes_bad_oldest_first() {
        let history = TestHistory::linear(5, 5).expect("history");
        let git = Git::new(history.root());
        let revs = git
            .revisions_between(history.good(), history.bad())
            .expect("rev-list");
        assert_eq!(revs, history.revisions()[1..].to_vec());
    }

    /// A merge-base message makes the currently checked-out revision the
    /// disambiguation candidate.
    #[test]
    fn classify_merge_base_yields_disambiguation_candidate() {
        let history = TestHistory::linear(3, 3).expect("history");
        let git = Git::new(history.root());
        let merge_base = history.revisions()[1].clone();
        git.checkout(&merge_base).expect("checkout");
        let walker = GitBisectWalker::new(git, ".culprit/");

        let output = "a merge base must be tested\n\
                      [1111111111111111111111111111111111111111] subject\n";
        match walker.classify(output).expect("classify") {
            MarkOutcome::NeedsDisambiguation(rev) => assert_eq!(rev, merge_base),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn classify_detects_culprit_line() {
        let walker = GitBisectWalker::new(Git::new("/nonexistent"), ".culprit/");
        let sha = "1234567890abcdef1234567890abcdef12345678";
        let output = format!("{sha} is the first bad commit\ncommit details follow\n");
        let outcome = walker.classify(&output).expect("classify");
        assert_eq!(outcome, MarkOutcome::Culprit(Revision::new(sha)));
    }

    #[test]
    fn classify_detects_exhausted_suspects() {
        let walker = GitBisectWalker::new(Git::new("/nonexistent"), ".culprit/");
        let output = "There are only skipped commits left to test.\n\
                      The first bad commit could be any of:\n\
                      1111111111111111111111111111111111111111\n\
                      2222222222222222222222222222222222222222\n\
                      We cannot bisect more!\n";
        match walker.classify(output).expect("classify") {
            MarkOutcome::Exhausted(suspects) => assert_eq!(suspects.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn classify_defaults_to_continuing() {
        let walker = GitBisectWalker::new(Git::new("/nonexistent"), ".culprit/");
        let output = "Bisecting: 5 revisions left to test after this (roughly 3 steps)\n\
                      [3333333333333333333333333333333333333333] some subject\n";
        assert_eq!(
            walker.classify(output).expect("classify"),
            MarkOutcome::Continuing
        );
    }

    #[test]
    fn bisect_log_yields_marked_revisions() {
        let log = "# bad: [1111111111111111111111111111111111111111] subject\n\
                   git bisect start '1111111111111111111111111111111111111111' '2222222222222222222222222222222222222222'\n\
                   git bisect good 3333333333333333333333333333333333333333\n\
                   git bisect skip 4444444444444444444444444444444444444444\n";
        let revs = parse_bisect_log_revs(log);
        assert_eq!(
            revs,
            vec![
                "3333333333333333333333333333333333333333".to_string(),
                "4444444444444444444444444444444444444444".to_string(),
            ]
        );
    }

    #[test]
    fn classify_rejects_malformed_culprit_line() {
        let walker = GitBisectWalker::new(Git::new("/nonexistent"), ".culprit/");
        let err = walker
            .classify("nothex is the first bad commit\n")
            .unwrap_err();
        assert!(err.to_string().contains("unparseable culprit line"));
    }
}
