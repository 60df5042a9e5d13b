//! Error types for the Quill engine.

use thiserror::Error;

use crate::workspace::ScriptId;

/// Result type alias for Quill operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Quill engine.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No open script with this identity.
    #[error("unknown script: {0}")]
    UnknownScript(ScriptId),

    /// A related script named a parent that is not open.
    #[error("unknown parent script: {0}")]
    UnknownParent(ScriptId),

    /// A script cannot be closed while related scripts still reference it.
    #[error("script {0} is still referenced by related scripts")]
    DocumentReferenced(ScriptId),

    /// The requested execution platform is not in the catalog.
    #[error("unknown execution platform: {0}")]
    UnknownPlatform(String),

    /// Source or directive parsing failed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Dependency resolution failed outright.
    #[error("restore failed: {0}")]
    Restore(String),

    /// Rustc rejected the assembled wrapper source.
    #[error("compilation failed{}: {message}", script.map(|id| format!(" for script {id}")).unwrap_or_default())]
    Compilation {
        script: Option<ScriptId>,
        message: String,
    },

    /// IPC communication with the runner process failed.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization of an IPC message failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The runner process failed at the process level (spawn, crash).
    #[error("runner process error: {0}")]
    Process(String),

    /// Rust toolchain discovery or probing failed.
    #[error("toolchain error: {0}")]
    Toolchain(String),

    /// Execution was cancelled.
    ///
    /// The one error allowed to cross stage boundaries uncaught: it
    /// short-circuits the remaining pipeline stages of a cancelled run.
    #[error("execution aborted")]
    Aborted,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
