//! Compiler configuration and artifact types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::diagnostics::Diagnostic;
use crate::paths::ScriptDirs;
use crate::workspace::ScriptId;

/// Optimization level for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    #[default]
    Debug,
    Release,
}

impl OptimizationLevel {
    /// The value rustc expects for `-Copt-level`.
    pub fn rustc_opt_level(&self) -> &'static str {
        match self {
            OptimizationLevel::Debug => "0",
            OptimizationLevel::Release => "3",
        }
    }

    /// Short tag used in artifact file names so both levels cache
    /// side by side.
    pub fn tag(&self) -> &'static str {
        match self {
            OptimizationLevel::Debug => "debug",
            OptimizationLevel::Release => "release",
        }
    }
}

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Directory for assembled wrapper sources and compiled artifacts.
    pub build_dir: PathBuf,

    /// Directory for cache metadata.
    pub cache_dir: PathBuf,

    /// Emit debug info for debug-level compiles.
    pub debug_info: bool,

    /// Extra flags passed through to rustc.
    pub extra_rustc_flags: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from(".quill/build"),
            cache_dir: PathBuf::from(".quill/cache"),
            debug_info: true,
            extra_rustc_flags: Vec::new(),
        }
    }
}

impl CompilerConfig {
    /// Configuration rooted at a working directory's layout.
    ///
    /// Callers flip `debug_info` off for release-level compiles.
    pub fn for_workspace(dirs: &ScriptDirs) -> Self {
        Self {
            build_dir: dirs.build_dir.clone(),
            cache_dir: dirs.cache_dir.clone(),
            ..Default::default()
        }
    }
}

/// A successfully compiled script artifact.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    /// Owning script identity.
    pub script: ScriptId,

    /// Path to the compiled dynamic library.
    pub dylib_path: PathBuf,

    /// Exported entry symbol.
    pub entry_symbol: String,

    /// Hash of the assembled source.
    pub source_hash: u64,

    /// Hash of the reference set it was linked against.
    pub deps_hash: u64,

    /// Wall-clock compile time in milliseconds (0 for cache hits).
    pub compile_time_ms: u64,
}

/// Result of compiling one script.
#[derive(Debug)]
pub enum CompileOutcome {
    /// Fresh artifact; non-fatal diagnostics (warnings) ride along.
    Success {
        artifact: CompiledScript,
        diagnostics: Vec<Diagnostic>,
    },
    /// Artifact reused from cache without invoking rustc.
    Cached(CompiledScript),
    /// Error-severity diagnostics; no artifact was produced.
    Failed { diagnostics: Vec<Diagnostic> },
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Success { .. } | CompileOutcome::Cached(_))
    }

    /// The artifact, when compilation succeeded.
    pub fn artifact(&self) -> Option<&CompiledScript> {
        match self {
            CompileOutcome::Success { artifact, .. } => Some(artifact),
            CompileOutcome::Cached(artifact) => Some(artifact),
            CompileOutcome::Failed { .. } => None,
        }
    }
}

/// File extension rustc gives cdylib artifacts on this platform.
pub fn dylib_extension() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "so"
    }
    #[cfg(target_os = "macos")]
    {
        "dylib"
    }
    #[cfg(target_os = "windows")]
    {
        "dll"
    }
}

/// File name prefix rustc gives cdylib artifacts on this platform.
pub fn dylib_prefix() -> &'static str {
    #[cfg(unix)]
    {
        "lib"
    }
    #[cfg(windows)]
    {
        ""
    }
}
