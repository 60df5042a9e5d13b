//! Asynchronous execution host for Quill scripts.
//!
//! Sits on top of [`quill_core`]: callers open scripts, subscribe to
//! their event streams, and request runs; the host drives restore,
//! compilation, and isolated execution, and streams
//! [`ExecutionEvent`]s back. Each script gets at most one run at a
//! time, ended by exactly one terminal event.

pub mod error;
pub mod events;
pub mod host;
pub mod sink;

mod session;

pub use error::{HostError, HostResult};
pub use events::{DiagnosticInfo, EventLocation, ExecutionEvent, RunPhase};
pub use host::{ExecutionHost, HostConfig, RestorePolicy, RunRequest};
pub use sink::{CancelToken, EventSink, RunOutcome};
