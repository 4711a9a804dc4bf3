//! State machine module.

pub mod machine;

pub use machine::{FailureReason, SessionState, StateMachineContext};
