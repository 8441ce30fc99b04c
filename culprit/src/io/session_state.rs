//! Session state storage for crash recovery bookkeeping.
//!
//! The durable history of verdicts lives in the append-only run log
//! (`io::recorder`); this file holds only the phase, the anchors, and the
//! pending-revision watermark that `step()` uses to detect partial progress
//! after a restart.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::Revision;

/// Lifecycle phase of a bisection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NotStarted,
    Running,
    Complete,
}

/// Persisted bookkeeping for the current session (`<state-dir>/session.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Good anchor as established at session start.
    pub good: Option<Revision>,
    /// Bad anchor as established at session start.
    pub bad: Option<Revision>,
    /// Revision selected for testing but not yet marked.
    pub pending: Option<Revision>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::NotStarted,
            good: None,
            bad: None,
            pending: None,
        }
    }
}

impl SessionState {
    /// True if this state belongs to a search over the same anchor pair.
    pub fn matches_anchors(&self, good: &Revision, bad: &Revision) -> bool {
        self.good.as_ref() == Some(good) && self.bad.as_ref() == Some(bad)
    }
}

/// Load session state from disk, or default if the file does not exist.
pub fn load_session_state(path: &Path) -> Result<SessionState> {
    if !path.exists() {
        return Ok(SessionState::default());
    }
    debug!(path = %path.display(), "loading session state");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read session state {}", path.display()))?;
    let state: SessionState = serde_json::from_str(&contents)
        .with_context(|| format!("parse session state {}", path.display()))?;
    debug!(phase = ?state.phase, pending = ?state.pending, "session state loaded");
    Ok(state)
}

/// Atomically write session state to disk (temp file + rename).
pub fn write_session_state(path: &Path, state: &SessionState) -> Result<()> {
    debug!(path = %path.display(), phase = ?state.phase, "writing session state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Remove the session state file (explicit operator reset).
pub fn clear_session_state(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("remove session state {}", path.display()))?;
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace session state {}", path.display()))?;
    Ok(())
}
