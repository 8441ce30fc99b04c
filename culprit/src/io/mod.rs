//! Side-effecting operations: git, external processes, durable logs, and
//! configuration. Isolated from the pure core to enable scripted tests.

pub mod config;
pub mod git;
pub mod oracle;
pub mod process;
pub mod recorder;
pub mod session_state;
