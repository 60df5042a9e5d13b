//! Directory layout for per-workspace artifacts.
//!
//! All engine state for a script's working directory lives under a single
//! `.quill` directory:
//!
//! ```text
//! .quill/
//! ├── restore/    # generated dependency crate and its cargo target
//! ├── build/      # assembled wrapper sources and compiled artifacts
//! └── cache/      # hash and metadata files for cache validation
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Resolved paths for one working directory's engine state.
#[derive(Debug, Clone)]
pub struct ScriptDirs {
    /// Root `.quill` directory.
    pub quill_dir: PathBuf,
    /// Dependency restore area.
    pub restore_dir: PathBuf,
    /// Build area for wrapper sources and dylibs.
    pub build_dir: PathBuf,
    /// Cache metadata (hash files, artifact metadata).
    pub cache_dir: PathBuf,
}

impl ScriptDirs {
    /// Create the directory layout under the given working directory.
    ///
    /// All directories are created on demand if missing.
    pub fn from_working_dir(working_dir: &Path) -> Result<Self> {
        let quill_dir = working_dir.join(".quill");
        let restore_dir = quill_dir.join("restore");
        let build_dir = quill_dir.join("build");
        let cache_dir = quill_dir.join("cache");

        fs::create_dir_all(&restore_dir)?;
        fs::create_dir_all(&build_dir)?;
        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            quill_dir,
            restore_dir,
            build_dir,
            cache_dir,
        })
    }

    /// Remove all engine state and recreate the empty layout.
    pub fn clean(&self) -> Result<()> {
        if self.quill_dir.exists() {
            fs::remove_dir_all(&self.quill_dir)?;
        }
        fs::create_dir_all(&self.restore_dir)?;
        fs::create_dir_all(&self.build_dir)?;
        fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dirs_creation() {
        let tmp = TempDir::new().unwrap();
        let dirs = ScriptDirs::from_working_dir(tmp.path()).unwrap();

        assert!(dirs.quill_dir.ends_with(".quill"));
        assert!(dirs.restore_dir.exists());
        assert!(dirs.build_dir.exists());
        assert!(dirs.cache_dir.exists());
    }

    #[test]
    fn test_clean_removes_state() {
        let tmp = TempDir::new().unwrap();
        let dirs = ScriptDirs::from_working_dir(tmp.path()).unwrap();

        let marker = dirs.cache_dir.join("stale_hash");
        fs::write(&marker, "1234").unwrap();
        assert!(marker.exists());

        dirs.clean().unwrap();

        assert!(!marker.exists());
        assert!(dirs.restore_dir.exists());
        assert!(dirs.build_dir.exists());
        assert!(dirs.cache_dir.exists());
    }
}
