//! Execution events streamed per script identity.
//!
//! Events are delivered over a broadcast channel in program order:
//! restore events first, then compile diagnostics, then running events,
//! then exactly one terminal event per run.

use serde::{Deserialize, Serialize};

use quill_core::{Diagnostic, Severity};

/// One event in a script's execution stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Dependency restore started.
    RestoreStarted,

    /// Dependency restore finished.
    RestoreCompleted {
        /// Whether every declared package resolved.
        success: bool,
        /// One message per unresolved package.
        errors: Vec<String>,
    },

    /// Compiler (or restore-failure) diagnostics for the run.
    CompilationDiagnostics {
        /// Diagnostics mapped to the script's own line numbers.
        diagnostics: Vec<DiagnosticInfo>,
    },

    /// Text produced by the running script.
    Output {
        /// Chunk of output, not necessarily line-aligned.
        text: String,
    },

    /// Runtime error or panic reported by the running script.
    RuntimeError {
        /// Error text.
        message: String,
    },

    /// The script is blocked waiting for one line of input.
    InputRequested,

    /// Progress reported by the script, best effort.
    Progress {
        /// Percentage in 0.0..=100.0.
        percent: f64,
    },

    /// Assembly listing for the compiled script.
    Disassembly {
        /// Full listing text.
        text: String,
    },

    /// Terminal: the run finished normally.
    Completed,

    /// Terminal: the pipeline itself failed.
    Faulted {
        /// Process-level failure description, when one exists beyond the
        /// already-emitted diagnostics.
        error: Option<String>,
    },

    /// Terminal: the run was cancelled or superseded.
    Cancelled,
}

impl ExecutionEvent {
    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Completed
                | ExecutionEvent::Faulted { .. }
                | ExecutionEvent::Cancelled
        )
    }
}

/// A diagnostic as delivered to event consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticInfo {
    /// Diagnostic message.
    pub message: String,
    /// Code (e.g. `E0308`) or lint name.
    pub code: Option<String>,
    /// Severity as a lowercase string.
    pub severity: String,
    /// Primary location in the script's own coordinates.
    pub location: Option<EventLocation>,
    /// Compiler-rendered text.
    pub rendered: Option<String>,
}

/// A source position in event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLocation {
    /// 1-indexed line.
    pub line: u32,
    /// 1-indexed column.
    pub column: u32,
    /// End line of the primary span, when known.
    pub end_line: Option<u32>,
    /// End column of the primary span, when known.
    pub end_column: Option<u32>,
}

impl From<&Diagnostic> for DiagnosticInfo {
    fn from(diagnostic: &Diagnostic) -> Self {
        let severity = match diagnostic.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
            Severity::Help => "help",
        };

        let end = diagnostic
            .spans
            .iter()
            .find(|span| span.is_primary)
            .and_then(|span| span.end_location.as_ref());

        let location = diagnostic.location.as_ref().map(|loc| EventLocation {
            line: loc.line as u32,
            column: loc.column as u32,
            end_line: end.map(|l| l.line as u32),
            end_column: end.map(|l| l.column as u32),
        });

        Self {
            message: diagnostic.message.clone(),
            code: diagnostic.code.clone(),
            severity: severity.to_string(),
            location,
            rendered: diagnostic.rendered.clone(),
        }
    }
}

impl DiagnosticInfo {
    /// An error-severity diagnostic carrying only a message.
    ///
    /// Used for restore failures and process-level errors that have no
    /// source position.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            severity: "error".to_string(),
            location: None,
            rendered: None,
        }
    }
}

/// Pipeline phase of a script identity, for status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// No run in flight.
    #[default]
    Idle,
    /// Resolving declared references.
    Restoring,
    /// Compiling the script.
    Compiling,
    /// The isolated process is executing.
    Running,
    /// Last run finished normally.
    Completed,
    /// Last run faulted.
    Faulted,
    /// Last run was cancelled.
    Cancelled,
}
