//! Core engine for the Quill script workspace.
//!
//! Everything the host and CLI share lives here:
//! - Script registry with immutable compilation snapshots
//! - Inline `cargo` directive parsing and dependency restore
//! - Compilation pipeline (rustc → cdylib, diagnostics mapped back)
//! - Toolchain and platform detection
//! - IPC with isolated runner processes

pub mod abi;
pub mod cancel;
pub mod compile;
pub mod error;
pub mod ipc;
pub mod paths;
pub mod platform;
pub mod restore;
pub mod workspace;

pub use cancel::CancelFlag;
pub use compile::{
    CompileOutcome, CompiledScript, CompilerConfig, Diagnostic, OptimizationLevel, ScriptCompiler,
    Severity, SourceLocation,
};
pub use error::{Error, Result};
pub use ipc::{RunnerCommand, RunnerEvent, RunnerHandle, RunnerInputHandle, RunnerKillHandle, RunnerPool};
pub use paths::ScriptDirs;
pub use platform::{ExecutionPlatform, PlatformCatalog};
pub use restore::{
    DependencyResolver, DirectiveParser, PackageRequest, ReferenceSet, RestoreOutcome,
    requests_hash,
};
pub use workspace::{
    CompilationUnit, Document, Edition, OpenArgs, ParseMode, ScriptId, Solution, Workspace,
    WorkspaceRegistry,
};
