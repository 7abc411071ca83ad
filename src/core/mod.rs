//! Core domain types: identifiers, tasks, states, attempts and retry policy.

pub mod attempt;
pub mod retry;
pub mod state;
pub mod task;
pub mod types;
