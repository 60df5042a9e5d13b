//! Compilation pipeline for Quill scripts.
//!
//! The pieces, in pipeline order:
//! - Wrapper assembly (script source → compilable cdylib source)
//! - Script compilation (rustc invocation with artifact caching)
//! - Diagnostic mapping (rustc JSON → original source locations)
//!
//! # Architecture
//!
//! ```text
//! Script source
//!     │
//!     └── WrapperAssembler ──► script_*.rs ──► ScriptCompiler ──► libscript_*.so
//!                 │                                  │
//!                 └── LineMapper ◄── rustc JSON ─────┘
//! ```

mod compiler;
mod diagnostics;
mod types;
mod wrapper;

pub use compiler::ScriptCompiler;
pub use diagnostics::{Diagnostic, DiagnosticSpan, LineMapper, Severity, SourceLocation};
pub use types::{
    CompileOutcome, CompiledScript, CompilerConfig, OptimizationLevel, dylib_extension,
    dylib_prefix,
};
pub use wrapper::{AssembledSource, WrapperAssembler};
