//! Generic bisection engine: find the change that introduced a regression.
//!
//! Given a range of history bounded by a known-good and a known-bad anchor
//! and an external measurement oracle, the engine narrows the range until a
//! single culprit revision remains. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (verdict policies, revision
//!   walkers). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (git, process execution, the
//!   durable run log and session state). Isolated to enable substitution in
//!   tests.
//!
//! Orchestration modules ([`session`], [`driver`], [`sweep`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
pub mod sweep;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
