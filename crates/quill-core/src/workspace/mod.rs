//! Script workspace model: identities, snapshots, and the registry.
//!
//! Every open script is addressed by an opaque [`ScriptId`] and backed by an
//! immutable [`CompilationUnit`] snapshot inside a [`Workspace`]. Related
//! scripts (derivative submissions in a REPL-style chain) share one
//! workspace and see their ancestors' declarations at compile time.

mod registry;
mod unit;

pub use registry::{Document, Solution, Workspace, WorkspaceRegistry};
pub use unit::{CompilationUnit, Edition, OpenArgs, ParseMode, ScriptId};
