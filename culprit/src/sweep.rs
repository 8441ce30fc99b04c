//! Range sweep: measure every Nth revision of an explicit ordered list.
//!
//! No policy and no walker are involved. Each sampled revision is checked
//! out, measured, and recorded with its raw oracle status so the operator
//! can eyeball where a metric drifts before committing to a bisection.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::info;

use crate::core::types::{OracleResult, Revision};
use crate::io::git::Git;
use crate::io::oracle::Oracle;
use crate::io::recorder::{RecordKind, RunRecorder, VerdictRecord};

/// One sampled revision and its raw oracle outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRow {
    pub revision: Revision,
    pub result: OracleResult,
}

/// Check out and measure every `every`-th revision of `revisions`, appending
/// one status record per sample. The working copy is restored after each
/// sample and left on the last one measured.
pub fn run_sweep<O: Oracle>(
    git: &Git,
    oracle: &O,
    recorder: &RunRecorder,
    label: &str,
    revisions: &[Revision],
    every: usize,
    state_prefix: &str,
) -> Result<Vec<SweepRow>> {
    if every == 0 {
        return Err(anyhow!("sweep stride must be at least 1"));
    }
    if revisions.is_empty() {
        return Err(anyhow!("sweep range is empty"));
    }

    let mut rows = Vec::new();
    for revision in revisions.iter().step_by(every) {
        git.checkout(revision)
            .with_context(|| format!("check out {}", revision.short()))?;
        let result = oracle
            .measure(revision)
            .with_context(|| format!("measure {}", revision.short()))?;
        recorder.append(&VerdictRecord {
            timestamp: Utc::now(),
            revision: revision.clone(),
            label: label.to_string(),
            kind: RecordKind::Status(result.status),
            metric: result.metric,
        })?;
        git.restore_worktree(state_prefix)
            .with_context(|| format!("restore working copy after {}", revision.short()))?;
        info!(
            rev = revision.short(),
            status = ?result.status,
            metric = result.metric,
            "sweep sample"
        );
        rows.push(SweepRow {
            revision: revision.clone(),
            result,
        });
    }
    Ok(rows)
}
