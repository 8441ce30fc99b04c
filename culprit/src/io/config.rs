//! Engine configuration stored under `<state-dir>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Oracle and engine configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values. Anchors, paths,
/// and policy selection arrive via the CLI, not this file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Label used in run-log records and artifact file names.
    pub label: String,

    /// Regex extracting the metric from measurement stdout. Must contain
    /// exactly one capture group matching a number.
    pub metric_pattern: String,

    /// File that must exist in the working copy for a revision to be
    /// testable. Absence maps the revision to an inconclusive result.
    pub required_file: Option<PathBuf>,

    /// Build/install command executed before measurement.
    pub build: CommandSpec,

    /// Measurement command whose stdout carries the metric.
    pub measure: CommandSpec,

    /// Auxiliary structural check command, run only when enabled.
    pub check: CommandSpec,

    /// Whether the structural check step runs in addition to measurement.
    pub run_check: bool,

    /// Wall-clock budget per external command, in seconds.
    pub step_timeout_secs: u64,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Engine state directory, relative to the history working copy.
    /// Excluded from working-copy cleanliness enforcement.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSpec {
    /// Command to execute as an argv array (e.g. `["npm", "install"]`).
    pub command: Vec<String>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            command: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            label: "build-time".to_string(),
            metric_pattern: r"Build time: ([0-9.]+)s".to_string(),
            required_file: None,
            build: CommandSpec::default(),
            measure: CommandSpec::default(),
            check: CommandSpec::default(),
            run_check: false,
            step_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            state_dir: PathBuf::from(".culprit"),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(anyhow!("label must not be empty"));
        }
        regex::Regex::new(&self.metric_pattern)
            .map_err(|e| anyhow!("invalid metric_pattern: {e}"))?;
        if self.measure.command.is_empty() || self.measure.command[0].trim().is_empty() {
            return Err(anyhow!("measure.command must be a non-empty array"));
        }
        if self.run_check && self.check.command.is_empty() {
            return Err(anyhow!("run_check is set but check.command is empty"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(anyhow!("state_dir must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns a default config (which still must be
/// completed with a measure command before it validates).
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
