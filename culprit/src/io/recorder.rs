//! Append-only run recording: the durable verdict log, per-revision
//! artifacts, and the replayable completion transcript.
//!
//! These are product artifacts, always written regardless of `RUST_LOG`.
//! The log is the audit trail and the crash-recovery source of truth: one
//! tab-separated line per decision, never edited or removed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{MarkOutcome, OracleStatus, Revision, Verdict};
use crate::core::walker::{RevisionWalker, replay_marks};

/// What the verdict-or-status column of a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A bisection verdict applied to the revision.
    Verdict(Verdict),
    /// A raw oracle status (range sweep records, and skip diagnostics).
    Status(OracleStatus),
    /// The terminal record naming the culprit.
    Culprit,
}

impl RecordKind {
    fn as_str(self) -> &'static str {
        match self {
            RecordKind::Verdict(v) => v.as_str(),
            RecordKind::Status(OracleStatus::Ok) => "ok",
            RecordKind::Status(OracleStatus::Fail) => "fail",
            RecordKind::Status(OracleStatus::Inconclusive) => "inconclusive",
            RecordKind::Culprit => "culprit",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        if let Some(verdict) = Verdict::parse(s) {
            return Some(RecordKind::Verdict(verdict));
        }
        match s {
            "ok" => Some(RecordKind::Status(OracleStatus::Ok)),
            "fail" => Some(RecordKind::Status(OracleStatus::Fail)),
            "inconclusive" => Some(RecordKind::Status(OracleStatus::Inconclusive)),
            "culprit" => Some(RecordKind::Culprit),
            _ => None,
        }
    }
}

/// One durable line of the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct VerdictRecord {
    pub timestamp: DateTime<Utc>,
    pub revision: Revision,
    pub label: String,
    pub kind: RecordKind,
    pub metric: Option<f64>,
}

impl VerdictRecord {
    fn to_line(&self) -> String {
        let metric = match self.metric {
            Some(m) => m.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.timestamp.to_rfc3339(),
            self.revision.hash,
            self.label,
            self.kind.as_str(),
            metric
        )
    }

    fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 5 {
            return Err(anyhow!("malformed run log line: '{line}'"));
        }
        let timestamp = DateTime::parse_from_rfc3339(fields[0])
            .with_context(|| format!("bad timestamp in run log line: '{line}'"))?
            .with_timezone(&Utc);
        let kind = RecordKind::parse(fields[3])
            .ok_or_else(|| anyhow!("unknown verdict-or-status '{}' in run log", fields[3]))?;
        let metric = match fields[4] {
            "-" => None,
            raw => Some(
                raw.parse::<f64>()
                    .with_context(|| format!("bad metric in run log line: '{line}'"))?,
            ),
        };
        Ok(Self {
            timestamp,
            revision: Revision::new(fields[1].to_string()),
            label: fields[2].to_string(),
            kind,
            metric,
        })
    }
}

/// Replayable transcript of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub good: Revision,
    pub bad: Revision,
    /// Ordered verdict sequence exactly as applied.
    pub marks: Vec<TranscriptMark>,
    pub culprit: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMark {
    pub revision: Revision,
    pub verdict: Verdict,
}

impl Transcript {
    /// Re-apply the recorded verdict sequence against a fresh walker with no
    /// oracle involvement. Returns the reconstructed culprit, which must
    /// match the recorded one.
    pub fn replay<W: RevisionWalker>(&self, walker: &mut W) -> Result<Revision> {
        walker.start(&self.good, &self.bad)?;
        let marks: Vec<(Revision, Verdict)> = self
            .marks
            .iter()
            .map(|m| (m.revision.clone(), m.verdict))
            .collect();
        let outcome = match replay_marks(walker, &marks)? {
            MarkOutcome::Continuing => walker.conclude()?,
            terminal => terminal,
        };
        match outcome {
            MarkOutcome::Culprit(found) if found == self.culprit => Ok(found),
            MarkOutcome::Culprit(found) => Err(anyhow!(
                "transcript replay diverged: recorded culprit {} but replay found {}",
                self.culprit.short(),
                found.short()
            )),
            other => Err(anyhow!("transcript replay did not terminate: {other:?}")),
        }
    }
}

/// Recorder for one session's durable outputs under the state directory.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    log_path: PathBuf,
    artifacts_dir: PathBuf,
    transcript_path: PathBuf,
}

impl RunRecorder {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            log_path: state_dir.join("run.log"),
            artifacts_dir: state_dir.join("artifacts"),
            transcript_path: state_dir.join("transcript.json"),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn transcript_path(&self) -> &Path {
        &self.transcript_path
    }

    /// Append one record and flush. Any failure here is fatal to the session.
    pub fn append(&self, record: &VerdictRecord) -> Result<()> {
        let parent = self
            .log_path
            .parent()
            .ok_or_else(|| anyhow!("run log path missing parent"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("open run log {}", self.log_path.display()))?;
        writeln!(file, "{}", record.to_line())
            .with_context(|| format!("append run log {}", self.log_path.display()))?;
        file.flush()
            .with_context(|| format!("flush run log {}", self.log_path.display()))?;
        debug!(revision = record.revision.short(), kind = record.kind.as_str(), "recorded");
        Ok(())
    }

    /// Append the terminal culprit record.
    pub fn finalize(&self, label: &str, culprit: &Revision, timestamp: DateTime<Utc>) -> Result<()> {
        self.append(&VerdictRecord {
            timestamp,
            revision: culprit.clone(),
            label: label.to_string(),
            kind: RecordKind::Culprit,
            metric: None,
        })
    }

    /// Parse the full run log back into records.
    pub fn load_records(&self) -> Result<Vec<VerdictRecord>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.log_path)
            .with_context(|| format!("read run log {}", self.log_path.display()))?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(VerdictRecord::parse_line)
            .collect()
    }

    /// The ordered verdict sequence recorded so far (excludes sweep/status
    /// rows and the terminal record).
    pub fn verdict_marks(&self) -> Result<Vec<(Revision, Verdict)>> {
        Ok(self
            .load_records()?
            .into_iter()
            .filter_map(|r| match r.kind {
                RecordKind::Verdict(v) => Some((r.revision, v)),
                _ => None,
            })
            .collect())
    }

    /// Verdict already recorded for a revision, if any.
    pub fn verdict_for(&self, revision: &Revision) -> Result<Option<Verdict>> {
        Ok(self
            .verdict_marks()?
            .into_iter()
            .find(|(rev, _)| rev == revision)
            .map(|(_, verdict)| verdict))
    }

    /// Write the detailed per-revision artifact, named deterministically from
    /// the label and the short revision id.
    pub fn write_artifact(&self, label: &str, revision: &Revision, contents: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.artifacts_dir)
            .with_context(|| format!("create artifacts dir {}", self.artifacts_dir.display()))?;
        let path = self
            .artifacts_dir
            .join(format!("{label}-{}.log", revision.short()));
        fs::write(&path, contents)
            .with_context(|| format!("write artifact {}", path.display()))?;
        Ok(path)
    }

    /// Persist the completion transcript.
    pub fn write_transcript(&self, transcript: &Transcript) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(transcript)?;
        buf.push('\n');
        fs::write(&self.transcript_path, buf)
            .with_context(|| format!("write transcript {}", self.transcript_path.display()))
    }

    pub fn load_transcript(&self) -> Result<Transcript> {
        let contents = fs::read_to_string(&self.transcript_path)
            .with_context(|| format!("read transcript {}", self.transcript_path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse transcript {}", self.transcript_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::walker::ListWalker;

    fn record(hash: &str, kind: RecordKind, metric: Option<f64>) -> VerdictRecord {
        VerdictRecord {
            timestamp: Utc::now(),
            revision: Revision::new(hash),
            label: "build-time".to_string(),
            kind,
            metric,
        }
    }

    #[test]
    fn append_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recorder = RunRecorder::new(temp.path());

        let records = vec![
            record("aaaa", RecordKind::Verdict(Verdict::Good), Some(281.5)),
            record("bbbb", RecordKind::Verdict(Verdict::Skip), None),
            record("cccc", RecordKind::Culprit, None),
        ];
        for r in &records {
            recorder.append(r).expect("append");
        }

        let loaded = recorder.load_records().expect("load");
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].revision.hash, "aaaa");
        assert_eq!(loaded[0].metric, Some(281.5));
        assert_eq!(loaded[1].kind, RecordKind::Verdict(Verdict::Skip));
        assert_eq!(loaded[2].kind, RecordKind::Culprit);
    }

    #[test]
    fn verdict_marks_exclude_status_and_terminal_rows() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recorder = RunRecorder::new(temp.path());
        recorder
            .append(&record("aaaa", RecordKind::Verdict(Verdict::Good), Some(1.0)))
            .expect("append");
        recorder
            .append(&record("bbbb", RecordKind::Status(OracleStatus::Ok), Some(2.0)))
            .expect("append");
        recorder
            .append(&record("cccc", RecordKind::Culprit, None))
            .expect("append");

        let marks = recorder.verdict_marks().expect("marks");
        assert_eq!(marks, vec![(Revision::new("aaaa"), Verdict::Good)]);
        assert_eq!(
            recorder.verdict_for(&Revision::new("aaaa")).expect("lookup"),
            Some(Verdict::Good)
        );
        assert_eq!(
            recorder.verdict_for(&Revision::new("bbbb")).expect("lookup"),
            None
        );
    }

    #[test]
    fn malformed_line_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recorder = RunRecorder::new(temp.path());
        fs::create_dir_all(temp.path()).expect("dir");
        fs::write(recorder.log_path(), "not a record\n").expect("write");
        assert!(recorder.load_records().is_err());
    }

    #[test]
    fn artifact_names_are_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recorder = RunRecorder::new(temp.path());
        let rev = Revision::new("0123456789abcdef0123456789abcdef01234567");
        let path = recorder
            .write_artifact("build-time", &rev, "dump")
            .expect("write");
        assert!(path.ends_with("artifacts/build-time-0123456789ab.log"));
        assert_eq!(fs::read_to_string(path).expect("read"), "dump");
    }

    /// Replaying a saved transcript reconstructs the identical culprit with
    /// no oracle involvement.
    #[test]
    fn transcript_replay_reconstructs_culprit() {
        let revisions: Vec<Revision> =
            (0..8).map(|i| Revision::new(format!("rev{i:02}"))).collect();
        let transcript = Transcript {
            good: revisions[0].clone(),
            bad: revisions[7].clone(),
            marks: vec![
                TranscriptMark {
                    revision: revisions[3].clone(),
                    verdict: Verdict::Good,
                },
                TranscriptMark {
                    revision: revisions[5].clone(),
                    verdict: Verdict::Bad,
                },
                TranscriptMark {
                    revision: revisions[4].clone(),
                    verdict: Verdict::Good,
                },
            ],
            culprit: revisions[5].clone(),
        };

        let mut walker = ListWalker::new(revisions.clone());
        let found = transcript.replay(&mut walker).expect("replay");
        assert_eq!(found, revisions[5]);
    }

    #[test]
    fn transcript_replay_detects_divergence() {
        let revisions: Vec<Revision> =
            (0..4).map(|i| Revision::new(format!("rev{i:02}"))).collect();
        let transcript = Transcript {
            good: revisions[0].clone(),
            bad: revisions[3].clone(),
            marks: vec![
                TranscriptMark {
                    revision: revisions[1].clone(),
                    verdict: Verdict::Good,
                },
                TranscriptMark {
                    revision: revisions[2].clone(),
                    verdict: Verdict::Good,
                },
            ],
            // Recorded culprit disagrees with what the marks imply.
            culprit: revisions[1].clone(),
        };
        let mut walker = ListWalker::new(revisions);
        let err = transcript.replay(&mut walker).unwrap_err();
        assert!(err.to_string().contains("diverged"));
    }

    #[test]
    fn transcript_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recorder = RunRecorder::new(temp.path());
        let transcript = Transcript {
            good: Revision::new("aaaa"),
            bad: Revision::new("bbbb"),
            marks: Vec::new(),
            culprit: Revision::new("bbbb"),
        };
        recorder.write_transcript(&transcript).expect("write");
        assert_eq!(recorder.load_transcript().expect("load"), transcript);
    }
}
