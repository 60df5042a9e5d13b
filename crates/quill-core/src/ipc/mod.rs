//! Inter-process communication with runner processes.
//!
//! Frame codec and process plumbing for talking to the isolated
//! runner processes that execute scripts.

pub mod protocol;
mod runner;

pub use protocol::{RunnerCommand, RunnerEvent, read_frame, write_frame};
pub use runner::{RunnerHandle, RunnerInputHandle, RunnerKillHandle, RunnerPool};
