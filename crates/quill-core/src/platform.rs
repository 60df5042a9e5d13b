//! Platform catalog: toolchain detection and per-platform runner
//! binaries.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// One execution platform the host can target.
#[derive(Debug, Clone)]
pub struct ExecutionPlatform {
    /// Platform identifier (a rustc target triple).
    pub id: String,

    /// Runner binary used to execute scripts on this platform.
    pub runner_path: PathBuf,
}

/// Detected toolchain and the platforms it can execute on.
#[derive(Debug, Clone)]
pub struct PlatformCatalog {
    /// Path to rustc.
    rustc_path: PathBuf,

    /// Path to cargo.
    cargo_path: PathBuf,

    /// Toolchain version string.
    version: String,

    /// Target triple rustc was built for.
    host_triple: String,

    /// Available execution platforms. Empty when no runner binary was
    /// found; compile-only use stays possible.
    platforms: Vec<ExecutionPlatform>,
}

impl PlatformCatalog {
    /// Detect the installed toolchain and build the platform list.
    pub fn detect() -> Result<Self> {
        let rustc_path = find_tool("rustc")?;
        let cargo_path = find_tool("cargo")?;

        let verbose = run_capture(&rustc_path, &["-vV"])?;
        let version = verbose.lines().next().unwrap_or_default().trim().to_string();
        let host_triple = parse_host_triple(&verbose).ok_or_else(|| {
            Error::Toolchain("rustc -vV output did not include a host triple".to_string())
        })?;

        let platforms = match find_runner_binary() {
            Ok(runner_path) => vec![ExecutionPlatform {
                id: host_triple.clone(),
                runner_path,
            }],
            Err(e) => {
                tracing::debug!("No runner binary found: {}", e);
                Vec::new()
            }
        };

        Ok(Self {
            rustc_path,
            cargo_path,
            version,
            host_triple,
            platforms,
        })
    }

    /// Path to the detected rustc binary.
    pub fn rustc_path(&self) -> &PathBuf {
        &self.rustc_path
    }

    /// Get the cargo path.
    pub fn cargo_path(&self) -> &PathBuf {
        &self.cargo_path
    }

    /// Version string reported by `rustc --version`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get the host target triple.
    pub fn host_triple(&self) -> &str {
        &self.host_triple
    }

    /// All platforms scripts can execute on.
    pub fn platforms(&self) -> &[ExecutionPlatform] {
        &self.platforms
    }

    /// Resolve a platform by identifier. `None` selects the host.
    pub fn platform(&self, id: Option<&str>) -> Result<&ExecutionPlatform> {
        let wanted = id.unwrap_or(&self.host_triple);

        if let Some(platform) = self.platforms.iter().find(|p| p.id == wanted) {
            return Ok(platform);
        }

        if wanted == self.host_triple {
            return Err(Error::Toolchain(RUNNER_NOT_FOUND.to_string()));
        }

        Err(Error::UnknownPlatform(wanted.to_string()))
    }

    /// Replace the runner binary for every platform.
    pub fn with_runner(mut self, runner_path: PathBuf) -> Self {
        if self.platforms.is_empty() {
            self.platforms.push(ExecutionPlatform {
                id: self.host_triple.clone(),
                runner_path,
            });
        } else {
            for platform in &mut self.platforms {
                platform.runner_path = runner_path.clone();
            }
        }
        self
    }
}

const RUNNER_NOT_FOUND: &str =
    "Could not find quill-runner binary. Set QUILL_RUNNER_PATH or ensure it's in PATH.";

/// Extract the `host:` line from `rustc -vV` output.
fn parse_host_triple(verbose_version: &str) -> Option<String> {
    verbose_version
        .lines()
        .find_map(|line| line.strip_prefix("host: "))
        .map(|host| host.trim().to_string())
}

fn find_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| Error::Toolchain(format!("{name} not found in PATH")))
}

fn run_capture(tool: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| Error::Toolchain(format!("failed to run {}: {}", tool.display(), e)))?;

    if !output.status.success() {
        return Err(Error::Toolchain(format!(
            "{} {} exited with {}",
            tool.display(),
            args.join(" "),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn runner_binary_name() -> &'static str {
    if cfg!(windows) {
        "quill-runner.exe"
    } else {
        "quill-runner"
    }
}

/// Find the quill-runner binary path.
///
/// Looks in the following order:
/// 1. `QUILL_RUNNER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. `target/{debug,release}` relative to the manifest (development)
pub fn find_runner_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("QUILL_RUNNER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let runner_path = exe_dir.join(runner_binary_name());
        if runner_path.exists() {
            return Ok(runner_path);
        }
    }

    if let Ok(path) = which::which(runner_binary_name()) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in &["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(runner_binary_name());
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Toolchain(RUNNER_NOT_FOUND.to_string()))
}
