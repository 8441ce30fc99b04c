//! Oracle adapter: one external measurement attempt, normalized.
//!
//! The [`Oracle`] trait decouples the session from the actual measurement
//! backend. [`CommandOracle`] drives the real external commands (structural
//! check, build/install, timed measurement); tests use scripted oracles that
//! return predetermined results without spawning processes.
//!
//! Classification rules: a structurally absent input makes the revision
//! untestable (`Inconclusive`); any command failure or timeout is a `Fail`
//! captured in diagnostics, never a propagated error; the only propagated
//! errors are infrastructure failures (artifact persistence, metric pattern
//! missing from successful output), which are fatal to the whole session.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{OracleResult, Revision};
use crate::io::config::{CommandSpec, EngineConfig};
use crate::io::process::run_command_with_timeout;
use crate::io::recorder::RunRecorder;

/// Abstraction over the external measurement procedure.
pub trait Oracle {
    /// Measure one revision. The engine calls this at most once per revision
    /// per session step; the working copy is already checked out.
    fn measure(&self, revision: &Revision) -> Result<OracleResult>;
}

/// Oracle that runs the configured external commands.
pub struct CommandOracle {
    /// History working copy; check and build commands run here.
    history_dir: PathBuf,
    /// Target artifact location; the measurement command runs here.
    target_dir: PathBuf,
    config: EngineConfig,
    metric_pattern: Regex,
    recorder: RunRecorder,
}

impl CommandOracle {
    pub fn new(
        history_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        config: EngineConfig,
        recorder: RunRecorder,
    ) -> Result<Self> {
        let metric_pattern = Regex::new(&config.metric_pattern)
            .with_context(|| format!("compile metric pattern '{}'", config.metric_pattern))?;
        Ok(Self {
            history_dir: history_dir.into(),
            target_dir: target_dir.into(),
            config,
            metric_pattern,
            recorder,
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.step_timeout_secs)
    }

    fn run_phase(&self, phase: &str, spec: &CommandSpec, dir: &Path) -> Result<PhaseOutput> {
        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..]).current_dir(dir);
        debug!(phase, command = ?spec.command, "running oracle phase");
        let output =
            run_command_with_timeout(cmd, None, self.timeout(), self.config.output_limit_bytes)?;
        let succeeded = output.status.success() && !output.timed_out;
        Ok(PhaseOutput {
            rendered: output.render(phase),
            stdout: output.stdout_lossy(),
            succeeded,
        })
    }

    /// Extract the metric from measurement stdout. Absence of the pattern on
    /// an otherwise successful run is a fatal parse error, distinct from a
    /// measurement failure.
    fn extract_metric(&self, stdout: &str) -> Result<f64> {
        let captures = self.metric_pattern.captures(stdout).ok_or_else(|| {
            anyhow!(
                "metric pattern '{}' not found in measurement output",
                self.config.metric_pattern
            )
        })?;
        let raw = captures
            .get(1)
            .ok_or_else(|| {
                anyhow!(
                    "metric pattern '{}' has no capture group",
                    self.config.metric_pattern
                )
            })?
            .as_str();
        raw.parse::<f64>()
            .with_context(|| format!("metric '{raw}' is not a number"))
    }

    /// A command failure that names the required input is the same
    /// untestable condition as the file being absent up front.
    fn structural_absence(&self, output: &str) -> Option<String> {
        let required = self.config.required_file.as_ref()?;
        let name = required.file_name()?.to_string_lossy();
        output.contains(name.as_ref()).then(|| {
            format!(
                "command output reports required input {} missing",
                required.display()
            )
        })
    }
}

struct PhaseOutput {
    rendered: String,
    stdout: String,
    succeeded: bool,
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(rev = revision.short()))]
    fn measure(&self, revision: &Revision) -> Result<OracleResult> {
        let mut transcript = String::new();

        // Untestable revision: a structurally absent input means this point
        // in history cannot be evaluated at all.
        if let Some(required) = &self.config.required_file {
            let path = self.history_dir.join(required);
            if !path.exists() {
                let diagnostics = format!(
                    "required input {} absent at this revision",
                    required.display()
                );
                warn!(%diagnostics, "revision untestable");
                transcript.push_str(&diagnostics);
                transcript.push('\n');
                self.recorder
                    .write_artifact(&self.config.label, revision, &transcript)?;
                return Ok(OracleResult::inconclusive(diagnostics));
            }
        }

        if self.config.run_check {
            let check = self.run_phase("check", &self.config.check, &self.history_dir)?;
            transcript.push_str(&check.rendered);
            if !check.succeeded {
                self.recorder
                    .write_artifact(&self.config.label, revision, &transcript)?;
                if let Some(diagnostics) = self.structural_absence(&check.rendered) {
                    warn!(%diagnostics, "revision untestable");
                    return Ok(OracleResult::inconclusive(diagnostics));
                }
                return Ok(OracleResult::fail(check.rendered));
            }
        }

        if !self.config.build.command.is_empty() {
            let build = self.run_phase("build", &self.config.build, &self.history_dir)?;
            transcript.push_str(&build.rendered);
            if !build.succeeded {
                self.recorder
                    .write_artifact(&self.config.label, revision, &transcript)?;
                if let Some(diagnostics) = self.structural_absence(&build.rendered) {
                    warn!(%diagnostics, "revision untestable");
                    return Ok(OracleResult::inconclusive(diagnostics));
                }
                return Ok(OracleResult::fail(build.rendered));
            }
        }

        let measure = self.run_phase("measure", &self.config.measure, &self.target_dir)?;
        transcript.push_str(&measure.rendered);
        self.recorder
            .write_artifact(&self.config.label, revision, &transcript)?;
        if !measure.succeeded {
            if let Some(diagnostics) = self.structural_absence(&measure.rendered) {
                warn!(%diagnostics, "revision untestable");
                return Ok(OracleResult::inconclusive(diagnostics));
            }
            return Ok(OracleResult::fail(measure.rendered));
        }

        let metric = self.extract_metric(&measure.stdout)?;
        info!(metric, "measurement complete");
        Ok(OracleResult::ok(metric, measure.rendered))
    }
}
