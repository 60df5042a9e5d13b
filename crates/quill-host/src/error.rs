//! Error types for the execution host.

/// Host error type.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Engine error from quill-core.
    #[error("Core error: {0}")]
    Core(#[from] quill_core::Error),

    /// Serializing an event to JSON failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background task failed or was torn down unexpectedly.
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type for host operations.
pub type HostResult<T> = std::result::Result<T, HostError>;
