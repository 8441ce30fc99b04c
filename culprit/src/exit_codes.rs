//! Stable exit codes for culprit CLI commands.

/// A culprit was identified, or the sweep completed.
pub const OK: i32 = 0;
/// Infrastructure failure: bad arguments, unresolvable anchors, recording
/// failures, or a measurement the oracle could not even attempt.
pub const FATAL: i32 = 1;
/// The search exhausted its candidates; only skipped revisions remain.
pub const EXHAUSTED: i32 = 2;
