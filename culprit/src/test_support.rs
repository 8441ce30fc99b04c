//! Test-only helpers: scripted oracles and a disposable git history.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};

use crate::core::types::{OracleResult, Revision};
use crate::io::oracle::Oracle;

/// Deterministic revision identifiers `rev00..revNN` for pure walker tests.
pub fn revision_list(n: usize) -> Vec<Revision> {
    (0..n).map(|i| Revision::new(format!("rev{i:02}"))).collect()
}

/// Oracle returning a scripted result per revision, no processes spawned.
pub struct ScriptedOracle {
    results: HashMap<String, OracleResult>,
}

impl ScriptedOracle {
    pub fn new(results: HashMap<String, OracleResult>) -> Self {
        Self { results }
    }

    /// Ok results with a metric derived from the revision's position.
    pub fn with_metrics(revisions: &[Revision], metric: impl Fn(usize) -> f64) -> Self {
        let results = revisions
            .iter()
            .enumerate()
            .map(|(idx, rev)| (rev.hash.clone(), OracleResult::ok(metric(idx), "scripted")))
            .collect();
        Self { results }
    }
}

impl Oracle for ScriptedOracle {
    fn measure(&self, revision: &Revision) -> Result<OracleResult> {
        self.results
            .get(&revision.hash)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted result for {}", revision.short()))
    }
}

/// Oracle delegating to a closure, for tests that assert on call patterns.
pub struct FnOracle<F: Fn(&Revision) -> Result<OracleResult>> {
    f: F,
}

impl<F: Fn(&Revision) -> Result<OracleResult>> FnOracle<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F: Fn(&Revision) -> Result<OracleResult>> Oracle for FnOracle<F> {
    fn measure(&self, revision: &Revision) -> Result<OracleResult> {
        (self.f)(revision)
    }
}

/// A temporary git repository with a linear history, for walker and driver
/// tests that need the real tool.
pub struct TestHistory {
    temp: tempfile::TempDir,
    revisions: Vec<Revision>,
}

impl TestHistory {
    /// Build `commits` sequential commits, each bumping `metric.txt`. The
    /// commit at `regression_at` (and all later ones) writes "slow" into
    /// `speed.txt`; earlier commits write "fast".
    pub fn linear(commits: usize, regression_at: usize) -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path();
        run_git(root, &["init", "--quiet", "--initial-branch=main"])?;
        run_git(root, &["config", "user.email", "test@example.com"])?;
        run_git(root, &["config", "user.name", "test"])?;

        let mut revisions = Vec::new();
        for i in 0..commits {
            fs::write(root.join("metric.txt"), format!("{i}\n")).context("write metric")?;
            let speed = if i >= regression_at { "slow" } else { "fast" };
            fs::write(root.join("speed.txt"), format!("{speed}\n")).context("write speed")?;
            run_git(root, &["add", "-A"])?;
            run_git(root, &["commit", "--quiet", "-m", &format!("commit {i}")])?;
            let out = capture_git(root, &["rev-parse", "HEAD"])?;
            revisions.push(Revision::new(out.trim().to_string()));
        }
        Ok(Self { temp, revisions })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn good(&self) -> &Revision {
        &self.revisions[0]
    }

    pub fn bad(&self) -> &Revision {
        self.revisions.last().expect("non-empty history")
    }

    /// Position of a revision in the linear history.
    pub fn index_of(&self, revision: &Revision) -> Option<usize> {
        self.revisions.iter().position(|r| r == revision)
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("git {} failed", args.join(" ")));
    }
    Ok(())
}

fn capture_git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!("git {} failed", args.join(" ")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// State directory path inside a test history.
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(".culprit")
}
