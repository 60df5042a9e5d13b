//! Dependency resolution ("restore") for script references.
//!
//! Declared package requests are materialized as a generated dependency
//! crate under `.quill/restore/`: a `Cargo.toml` listing the requests and a
//! `lib.rs` re-exporting each crate. Building it with cargo produces the
//! rlib the script compiler links against. The build is cached by request
//! hash and skipped when nothing changed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs2::FileExt;

use super::directives::{PackageRequest, requests_hash};
use crate::error::{Error, Result};
use crate::paths::ScriptDirs;

/// Crate name of the generated dependency hub.
const DEPS_CRATE: &str = "quill_deps";

/// Resolved binding of a script's declared references.
///
/// Replaced atomically after a restore; compared by `requests_hash` to
/// detect staleness against the currently declared request list.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    /// Hash of the request list this set satisfies.
    pub requests_hash: u64,
    /// The dependency hub rlib, when any request resolved.
    pub lib_path: Option<PathBuf>,
    /// Library search paths for the compiler (`-L`).
    pub search_paths: Vec<PathBuf>,
    /// Requests actually bound (the full list, or the resolved subset
    /// after a partial failure).
    pub resolved: Vec<PackageRequest>,
}

impl ReferenceSet {
    /// The binding of an empty request list.
    pub fn empty() -> Self {
        Self {
            requests_hash: requests_hash(&[]),
            lib_path: None,
            search_paths: Vec::new(),
            resolved: Vec::new(),
        }
    }

    /// Whether this set satisfies the given declared requests.
    pub fn satisfies(&self, requests: &[PackageRequest]) -> bool {
        self.requests_hash == requests_hash(requests)
    }
}

/// Result of one restore cycle.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// Whether every request resolved.
    pub success: bool,
    /// One message per unresolved request (empty on success). Each names
    /// the offending package.
    pub errors: Vec<String>,
    /// The reference set produced; on partial failure, the resolved
    /// subset is still bound so editing-level features keep working.
    pub references: ReferenceSet,
    /// Whether the cached artifacts were reused without running cargo.
    pub cached: bool,
}

/// Materializes declared references into a linkable dependency crate.
pub struct DependencyResolver {
    dirs: ScriptDirs,
    working_dir: PathBuf,
    cargo_path: PathBuf,
}

impl DependencyResolver {
    pub fn new(working_dir: &Path, cargo_path: PathBuf) -> Result<Self> {
        Ok(Self {
            dirs: ScriptDirs::from_working_dir(working_dir)?,
            working_dir: working_dir.to_path_buf(),
            cargo_path,
        })
    }

    /// Resolve the declared requests into a [`ReferenceSet`].
    ///
    /// Returns the cached binding without invoking cargo when the request
    /// hash matches the saved one and the artifact still exists, unless
    /// `force_refresh` is set. Emits no events; callers bracket this with
    /// their own restore start/completion notifications.
    pub fn resolve(
        &self,
        requests: &[PackageRequest],
        force_refresh: bool,
    ) -> Result<RestoreOutcome> {
        if requests.is_empty() {
            return Ok(RestoreOutcome {
                success: true,
                errors: Vec::new(),
                references: ReferenceSet::empty(),
                cached: true,
            });
        }

        let declared_hash = requests_hash(requests);
        if !force_refresh && self.is_cache_valid(declared_hash) && self.lib_path().exists() {
            tracing::info!("Using cached dependency library");
            return Ok(RestoreOutcome {
                success: true,
                errors: Vec::new(),
                references: self.reference_set(requests.to_vec()),
                cached: true,
            });
        }

        // Concurrent restores against one working directory share the
        // generated crate; serialize them with an advisory lock.
        let lock_file = fs::File::create(self.dirs.restore_dir.join(".lock"))?;
        lock_file.lock_exclusive()?;

        tracing::info!("Resolving {} package request(s)", requests.len());

        let mut remaining: Vec<PackageRequest> = requests.to_vec();
        let mut errors: Vec<String> = Vec::new();
        let mut built = false;

        // Retry without the offenders cargo names, so a partial set still
        // resolves. Bounded: each failing pass must remove at least one
        // request or give up.
        for _pass in 0..3 {
            let (ok, stderr) = self.run_build(&remaining)?;
            if ok {
                built = true;
                break;
            }

            let unresolved = Self::extract_unresolved(&stderr);
            if unresolved.is_empty() {
                // Unattributable failure (network, broken dependency build).
                let summary: String = stderr.lines().take(8).collect::<Vec<_>>().join("\n");
                errors.push(format!("dependency build failed: {summary}"));
                remaining.clear();
                break;
            }

            for name in &unresolved {
                errors.push(format!("package `{name}` could not be resolved"));
            }
            remaining.retain(|request| !unresolved.contains(&request.name));
            if remaining.is_empty() {
                break;
            }
        }

        let success = built && errors.is_empty();
        let references = if built && !remaining.is_empty() {
            self.reference_set(remaining)
        } else {
            ReferenceSet {
                requests_hash: requests_hash(&[]),
                lib_path: None,
                search_paths: Vec::new(),
                resolved: Vec::new(),
            }
        };

        if success {
            // Only a fully satisfied set marks the cache fresh; failed
            // restores stay stale so the next run retries.
            self.save_cache_hash(declared_hash)?;
        } else {
            tracing::warn!("Restore finished with {} error(s)", errors.len());
        }

        Ok(RestoreOutcome {
            success,
            errors,
            references,
            cached: false,
        })
    }

    /// Invalidate the cached binding so the next resolve re-runs cargo.
    pub fn invalidate_cache(&self) -> Result<()> {
        let hash_file = self.cache_hash_file();
        if hash_file.exists() {
            fs::remove_file(hash_file)?;
        }
        Ok(())
    }

    fn run_build(&self, requests: &[PackageRequest]) -> Result<(bool, String)> {
        let build_dir = &self.dirs.restore_dir;
        fs::create_dir_all(build_dir)?;

        fs::write(
            build_dir.join("Cargo.toml"),
            self.generate_cargo_toml(requests),
        )?;
        let src_dir = build_dir.join("src");
        fs::create_dir_all(&src_dir)?;
        fs::write(src_dir.join("lib.rs"), Self::generate_lib_rs(requests))?;

        let output = Command::new(&self.cargo_path)
            .current_dir(build_dir)
            .args(["build", "--release", "--lib"])
            .output()
            .map_err(|e| Error::Restore(format!("failed to run cargo: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            tracing::debug!("cargo build failed:\n{stderr}");
        }
        Ok((output.status.success(), stderr))
    }

    /// Pull the offending package names out of cargo's resolution errors.
    fn extract_unresolved(stderr: &str) -> Vec<String> {
        let mut names = Vec::new();
        for line in stderr.lines() {
            let name = Self::backticked_after(line, "no matching package named")
                .or_else(|| {
                    Self::backticked_after(line, "failed to select a version for the requirement")
                        .map(|req| {
                            // The requirement reads `name = "^1.0"`; keep the name.
                            req.split([' ', '='])
                                .next()
                                .unwrap_or(req.as_str())
                                .to_string()
                        })
                })
                .or_else(|| Self::backticked_after(line, "no matching version"));
            if let Some(name) = name
                && !name.is_empty()
                && !names.contains(&name)
            {
                names.push(name);
            }
        }
        names
    }

    /// First backtick-quoted token following `marker` on the line.
    fn backticked_after(line: &str, marker: &str) -> Option<String> {
        let rest = &line[line.find(marker)? + marker.len()..];
        let start = rest.find('`')? + 1;
        let end = start + rest[start..].find('`')?;
        Some(rest[start..end].to_string())
    }

    /// Generate Cargo.toml for the dependency hub crate.
    fn generate_cargo_toml(&self, requests: &[PackageRequest]) -> String {
        let mut toml = String::new();

        toml.push_str("[package]\n");
        toml.push_str(&format!("name = \"{DEPS_CRATE}\"\n"));
        toml.push_str("version = \"0.1.0\"\n");
        toml.push_str("edition = \"2021\"\n");
        toml.push('\n');
        toml.push_str("[lib]\n");
        toml.push_str("crate-type = [\"rlib\"]\n");
        toml.push('\n');
        toml.push_str("[dependencies]\n");

        for request in requests {
            if let Some(path) = &request.path {
                // Relative paths are written relative to the script's
                // working directory, not the generated crate.
                let absolute = if path.is_relative() {
                    self.working_dir.join(path)
                } else {
                    path.clone()
                };
                toml.push_str(&format!(
                    "{} = {{ path = \"{}\" }}\n",
                    request.name,
                    absolute.display()
                ));
            } else if let Some(version) = &request.version {
                if request.features.is_empty() {
                    toml.push_str(&format!("{} = \"{}\"\n", request.name, version));
                } else {
                    toml.push_str(&format!(
                        "{} = {{ version = \"{}\", features = [{}] }}\n",
                        request.name,
                        version,
                        request
                            .features
                            .iter()
                            .map(|f| format!("\"{f}\""))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
            }
        }

        // Empty [workspace] keeps the generated crate standalone instead of
        // joining an enclosing workspace.
        toml.push_str("\n[workspace]\n");

        toml
    }

    /// Generate lib.rs re-exporting every requested crate.
    fn generate_lib_rs(requests: &[PackageRequest]) -> String {
        let mut lib = String::new();

        lib.push_str("//! Generated re-export hub for script dependencies.\n\n");
        lib.push_str("#![allow(unused_imports)]\n");
        lib.push_str("#![allow(dead_code)]\n\n");

        for request in requests {
            let ident = request.name.replace('-', "_");
            lib.push_str(&format!("pub use {ident};\n"));
        }

        lib
    }

    fn reference_set(&self, resolved: Vec<PackageRequest>) -> ReferenceSet {
        let release_dir = self.dirs.restore_dir.join("target").join("release");
        ReferenceSet {
            requests_hash: requests_hash(&resolved),
            lib_path: Some(self.lib_path()),
            search_paths: vec![release_dir.clone(), release_dir.join("deps")],
            resolved,
        }
    }

    /// The dependency hub rlib (rlibs are lib-prefixed on every platform).
    fn lib_path(&self) -> PathBuf {
        self.dirs
            .restore_dir
            .join("target")
            .join("release")
            .join(format!("lib{DEPS_CRATE}.rlib"))
    }

    fn cache_hash_file(&self) -> PathBuf {
        self.dirs.cache_dir.join("restore_hash")
    }

    fn is_cache_valid(&self, declared_hash: u64) -> bool {
        let cache_file = self.cache_hash_file();
        if !cache_file.exists() {
            return false;
        }

        if let Ok(cached) = fs::read_to_string(&cache_file)
            && let Ok(hash) = cached.trim().parse::<u64>()
        {
            return hash == declared_hash;
        }

        false
    }

    fn save_cache_hash(&self, hash: u64) -> Result<()> {
        fs::create_dir_all(&self.dirs.cache_dir)?;
        fs::write(self.cache_hash_file(), hash.to_string())?;
        Ok(())
    }
}
