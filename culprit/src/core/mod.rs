//! Pure, deterministic bisection logic: types, verdict policies, and the
//! search state machine. No I/O, fully testable in isolation.

pub mod policy;
pub mod types;
pub mod walker;
