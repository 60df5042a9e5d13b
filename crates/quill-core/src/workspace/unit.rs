//! Script identities and immutable compilation snapshots.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque, process-unique identity of one open script.
///
/// Allocated by the registry on `open`/`open_related`; invalid after
/// `close`. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScriptId(u64);

impl ScriptId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the script source is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Statement sequence with an optional trailing expression whose value
    /// is dumped.
    #[default]
    Script,
    /// Ordinary crate body; execution calls the user's `fn main`.
    Program,
}

/// Rust language edition the script compiles under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Edition {
    #[serde(rename = "2021")]
    Rust2021,
    #[default]
    #[serde(rename = "2024")]
    Rust2024,
}

impl Edition {
    /// The string rustc expects for `--edition`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::Rust2021 => "2021",
            Edition::Rust2024 => "2024",
        }
    }
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments for opening a script.
#[derive(Debug, Clone)]
pub struct OpenArgs {
    /// Initial source text.
    pub source: String,
    /// Working directory for restore, build artifacts, and execution.
    pub working_dir: PathBuf,
    /// Parse mode.
    pub mode: ParseMode,
    /// Language edition.
    pub edition: Edition,
    /// Initial diagnostic suppressions (lint names or error codes).
    pub suppressions: Vec<String>,
}

impl OpenArgs {
    pub fn new(source: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            working_dir: working_dir.into(),
            mode: ParseMode::default(),
            edition: Edition::default(),
            suppressions: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: ParseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_edition(mut self, edition: Edition) -> Self {
        self.edition = edition;
        self
    }

    pub fn with_suppressions(mut self, suppressions: Vec<String>) -> Self {
        self.suppressions = suppressions;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "working directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Immutable snapshot of one script's compile-relevant state.
///
/// Every edit produces a fresh snapshot; readers holding an older
/// `Arc<CompilationUnit>` keep a fully consistent view.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    /// Owning script identity.
    pub id: ScriptId,
    /// Full source text.
    pub source: Arc<str>,
    /// Parse mode.
    pub mode: ParseMode,
    /// Language edition.
    pub edition: Edition,
    /// Working directory for restore/build/execution.
    pub working_dir: PathBuf,
    /// Diagnostics suppressed for this script (lint names or error codes).
    pub suppressions: Vec<String>,
}

impl CompilationUnit {
    pub(crate) fn from_args(id: ScriptId, args: OpenArgs) -> Self {
        Self {
            id,
            source: args.source.into(),
            mode: args.mode,
            edition: args.edition,
            working_dir: args.working_dir,
            suppressions: args.suppressions,
        }
    }

    /// New snapshot with replaced source text.
    pub(crate) fn with_source(&self, source: &str) -> Self {
        Self {
            source: source.into(),
            ..self.clone()
        }
    }

    /// New snapshot with one more suppressed diagnostic.
    pub(crate) fn with_suppression(&self, name: &str) -> Self {
        let mut next = self.clone();
        if !next.suppressions.iter().any(|s| s == name) {
            next.suppressions.push(name.to_string());
        }
        next
    }
}
