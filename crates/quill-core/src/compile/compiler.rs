//! Script compiler: drives rustc to produce a loadable cdylib per
//! script, with artifact caching keyed on source and dependency hashes.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::restore::ReferenceSet;
use crate::workspace::{CompilationUnit, ScriptId};

use super::diagnostics::Diagnostic;
use super::types::{
    CompileOutcome, CompiledScript, CompilerConfig, OptimizationLevel, dylib_extension,
    dylib_prefix,
};
use super::wrapper::{AssembledSource, WrapperAssembler, entry_symbol};

/// Compiles script snapshots to dynamic libraries.
pub struct ScriptCompiler {
    /// Directory layout and rustc flags.
    config: CompilerConfig,

    /// Path to the rustc binary.
    rustc_path: PathBuf,
}

impl ScriptCompiler {
    pub fn new(config: CompilerConfig, rustc_path: PathBuf) -> Self {
        Self { config, rustc_path }
    }

    /// Compile a script snapshot to a dynamic library.
    ///
    /// Never fails outright: environment problems surface as `Failed`
    /// outcomes carrying a bare diagnostic.
    pub fn compile(
        &self,
        unit: &CompilationUnit,
        ancestors: &[Arc<CompilationUnit>],
        references: &ReferenceSet,
        opt: OptimizationLevel,
    ) -> CompileOutcome {
        let source_hash = self.hash_inputs(unit, ancestors);
        let deps_hash = references.requests_hash;

        if let Some(cached) = self.check_cache(unit.id, opt, source_hash, deps_hash) {
            tracing::debug!("Using cached artifact for script {}", unit.id);
            return CompileOutcome::Cached(cached);
        }

        let start = Instant::now();
        let assembled = WrapperAssembler::assemble(unit, ancestors, references.lib_path.is_some());

        match self.compile_to_dylib(unit, &assembled, references, opt) {
            Ok((dylib_path, diagnostics)) => {
                let artifact = CompiledScript {
                    script: unit.id,
                    dylib_path,
                    entry_symbol: assembled.entry_symbol,
                    source_hash,
                    deps_hash,
                    compile_time_ms: start.elapsed().as_millis() as u64,
                };

                self.save_to_cache(&artifact, opt);

                CompileOutcome::Success {
                    artifact,
                    diagnostics,
                }
            }
            Err(diagnostics) => CompileOutcome::Failed { diagnostics },
        }
    }

    /// Emit the optimized assembly for a script.
    pub fn disassemble(
        &self,
        unit: &CompilationUnit,
        ancestors: &[Arc<CompilationUnit>],
        references: &ReferenceSet,
        opt: OptimizationLevel,
    ) -> Result<String> {
        fs::create_dir_all(&self.config.build_dir)?;

        let assembled = WrapperAssembler::assemble(unit, ancestors, references.lib_path.is_some());
        let src_file = self.source_path(unit.id, opt);
        fs::write(&src_file, &assembled.code)?;

        let asm_path = self
            .config
            .build_dir
            .join(format!("script_{}_{}.s", unit.id, opt.tag()));

        let mut cmd = Command::new(&self.rustc_path);
        cmd.arg(&src_file)
            .arg("--crate-type=cdylib")
            .arg(format!("--edition={}", unit.edition))
            .arg("--emit=asm")
            .arg("-o")
            .arg(&asm_path)
            .arg(format!("-Copt-level={}", opt.rustc_opt_level()));

        self.apply_lint_args(&mut cmd, unit);
        self.apply_link_args(&mut cmd, references);

        for flag in &self.config.extra_rustc_flags {
            cmd.arg(flag);
        }

        let output = cmd.output().map_err(|e| Error::Compilation {
            script: Some(unit.id),
            message: format!("failed to run rustc: {e}"),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let head: Vec<&str> = stderr.lines().take(8).collect();
            return Err(Error::Compilation {
                script: Some(unit.id),
                message: format!("assembly emission failed: {}", head.join("\n")),
            });
        }

        Ok(fs::read_to_string(&asm_path)?)
    }

    /// Compile the assembled wrapper, returning the artifact path and any
    /// surviving warnings.
    fn compile_to_dylib(
        &self,
        unit: &CompilationUnit,
        assembled: &AssembledSource,
        references: &ReferenceSet,
        opt: OptimizationLevel,
    ) -> std::result::Result<(PathBuf, Vec<Diagnostic>), Vec<Diagnostic>> {
        fs::create_dir_all(&self.config.build_dir)
            .map_err(|e| vec![Diagnostic::error(format!("Failed to create build directory: {e}"))])?;

        let src_file = self.source_path(unit.id, opt);
        fs::write(&src_file, &assembled.code)
            .map_err(|e| vec![Diagnostic::error(format!("Failed to write wrapper source: {e}"))])?;

        let dylib_path = self.artifact_path(unit.id, opt);

        let mut cmd = Command::new(&self.rustc_path);
        cmd.arg(&src_file)
            .arg("--crate-type=cdylib")
            .arg(format!("--edition={}", unit.edition))
            .arg("-o")
            .arg(&dylib_path)
            .arg("--error-format=json");

        cmd.arg(format!("-Copt-level={}", opt.rustc_opt_level()));

        if self.config.debug_info {
            cmd.arg("-g");
        }

        self.apply_lint_args(&mut cmd, unit);
        self.apply_link_args(&mut cmd, references);

        for flag in &self.config.extra_rustc_flags {
            cmd.arg(flag);
        }

        let output = cmd
            .output()
            .map_err(|e| vec![Diagnostic::error(format!("Failed to run rustc: {e}"))])?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics = apply_suppressions(
            assembled.mapper.parse_rustc_output(&stderr),
            &unit.suppressions,
        );

        if output.status.success() {
            Ok((dylib_path, diagnostics))
        } else if diagnostics.is_empty() {
            // Fallback if JSON parsing failed
            Err(vec![Diagnostic::from_rendered(stderr.to_string())])
        } else {
            Err(diagnostics)
        }
    }

    /// Lint-name suppressions go to rustc directly; error codes are
    /// filtered after parsing since `-A` only accepts lints.
    fn apply_lint_args(&self, cmd: &mut Command, unit: &CompilationUnit) {
        for name in &unit.suppressions {
            if lint_shaped(name) {
                cmd.arg("-A").arg(name);
            }
        }
    }

    /// Link the restored dependency crate, if one exists.
    ///
    /// `--extern` names the rlib directly; the `-L` paths let rustc find
    /// its transitive dependencies by metadata hash.
    fn apply_link_args(&self, cmd: &mut Command, references: &ReferenceSet) {
        let Some(rlib) = &references.lib_path else {
            return;
        };

        for dir in &references.search_paths {
            cmd.arg("-L").arg(dir);
        }

        if rlib.exists() {
            cmd.arg("--extern")
                .arg(format!("quill_deps={}", rlib.display()));
        } else if let Some(found) = find_deps_rlib(references) {
            cmd.arg("--extern")
                .arg(format!("quill_deps={}", found.display()));
        }
    }

    /// Hash everything that affects compilation output.
    fn hash_inputs(&self, unit: &CompilationUnit, ancestors: &[Arc<CompilationUnit>]) -> u64 {
        let mut hasher = DefaultHasher::new();
        unit.source.hash(&mut hasher);
        unit.edition.as_str().hash(&mut hasher);
        matches!(unit.mode, crate::workspace::ParseMode::Program).hash(&mut hasher);
        for name in &unit.suppressions {
            name.hash(&mut hasher);
        }
        for ancestor in ancestors {
            ancestor.source.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Check if a cached artifact is still valid.
    fn check_cache(
        &self,
        id: ScriptId,
        opt: OptimizationLevel,
        source_hash: u64,
        deps_hash: u64,
    ) -> Option<CompiledScript> {
        let dylib_path = self.artifact_path(id, opt);
        if !dylib_path.exists() {
            return None;
        }

        let meta_file = self.meta_path(id, opt);
        if let Ok(meta) = fs::read_to_string(&meta_file) {
            let lines: Vec<&str> = meta.lines().collect();
            if lines.len() >= 2
                && let (Ok(cached_src), Ok(cached_deps)) =
                    (lines[0].parse::<u64>(), lines[1].parse::<u64>())
                && cached_src == source_hash
                && cached_deps == deps_hash
            {
                return Some(CompiledScript {
                    script: id,
                    dylib_path,
                    entry_symbol: entry_symbol(id),
                    source_hash,
                    deps_hash,
                    compile_time_ms: 0,
                });
            }
        }

        None
    }

    /// Record the hashes behind an artifact.
    fn save_to_cache(&self, artifact: &CompiledScript, opt: OptimizationLevel) {
        let meta_file = self.meta_path(artifact.script, opt);

        if let Some(parent) = meta_file.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            tracing::warn!("Failed to create cache directory: {}", e);
            return;
        }

        let meta = format!("{}\n{}", artifact.source_hash, artifact.deps_hash);
        if let Err(e) = fs::write(&meta_file, meta) {
            tracing::warn!("Failed to save artifact metadata: {}", e);
        }
    }

    fn source_path(&self, id: ScriptId, opt: OptimizationLevel) -> PathBuf {
        self.config
            .build_dir
            .join(format!("script_{}_{}.rs", id, opt.tag()))
    }

    fn artifact_path(&self, id: ScriptId, opt: OptimizationLevel) -> PathBuf {
        self.config.build_dir.join(format!(
            "{}script_{}_{}.{}",
            dylib_prefix(),
            id,
            opt.tag(),
            dylib_extension()
        ))
    }

    fn meta_path(&self, id: ScriptId, opt: OptimizationLevel) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("script_{}_{}.meta", id, opt.tag()))
    }
}

/// Whether a suppression looks like a lint name rather than an error code.
fn lint_shaped(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Drop suppressed non-error diagnostics. Errors are never suppressed.
fn apply_suppressions(diagnostics: Vec<Diagnostic>, suppressions: &[String]) -> Vec<Diagnostic> {
    diagnostics
        .into_iter()
        .filter(|d| d.is_error() || !d.is_suppressed(suppressions))
        .collect()
}

/// Deps-dir fallback when the rlib is not at its canonical path.
fn find_deps_rlib(references: &ReferenceSet) -> Option<PathBuf> {
    for dir in &references.search_paths {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name_str = name.to_string_lossy();
                if name_str.starts_with("libquill_deps-") && name_str.ends_with(".rlib") {
                    return Some(entry.path());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::diagnostics::Severity;
    use crate::workspace::OpenArgs;
    use tempfile::TempDir;

    fn make_unit(id: u64, source: &str) -> CompilationUnit {
        CompilationUnit::from_args(
            ScriptId::from_raw(id),
            OpenArgs::new(source, "/tmp/quill-test"),
        )
    }

    fn compiler_in(tmp: &TempDir) -> ScriptCompiler {
        let config = CompilerConfig {
            build_dir: tmp.path().join("build"),
            cache_dir: tmp.path().join("cache"),
            ..CompilerConfig::default()
        };
        let rustc = which::which("rustc").unwrap_or_else(|_| PathBuf::from("rustc"));
        ScriptCompiler::new(config, rustc)
    }

    #[test]
    fn test_lint_shaped_names() {
        assert!(lint_shaped("unused_variables"));
        assert!(lint_shaped("dead_code"));
        assert!(!lint_shaped("E0308"));
        assert!(!lint_shaped(""));
    }

    #[test]
    fn test_suppressions_never_drop_errors() {
        let mut error = Diagnostic::error("boom");
        error.code = Some("E0308".to_string());

        let mut warning = Diagnostic::error("meh");
        warning.severity = Severity::Warning;
        warning.code = Some("unused_variables".to_string());

        let kept = apply_suppressions(
            vec![error, warning],
            &["E0308".to_string(), "unused_variables".to_string()],
        );

        assert_eq!(kept.len(), 1);
        assert!(kept[0].is_error());
    }

    #[test]
    fn test_hash_inputs_tracks_source_and_chain() {
        let tmp = TempDir::new().unwrap();
        let compiler = compiler_in(&tmp);

        let a = make_unit(1, "1 + 1");
        let b = make_unit(1, "2 + 2");
        assert_ne!(compiler.hash_inputs(&a, &[]), compiler.hash_inputs(&b, &[]));

        let parent = Arc::new(make_unit(2, "fn f() {}"));
        assert_ne!(
            compiler.hash_inputs(&a, &[]),
            compiler.hash_inputs(&a, &[parent])
        );

        let suppressed = CompilationUnit::from_args(
            ScriptId::from_raw(1),
            OpenArgs::new("1 + 1", "/tmp/quill-test")
                .with_suppressions(vec!["dead_code".to_string()]),
        );
        assert_ne!(
            compiler.hash_inputs(&a, &[]),
            compiler.hash_inputs(&suppressed, &[])
        );
    }

    #[test]
    fn test_cache_roundtrip_with_matching_hashes() {
        let tmp = TempDir::new().unwrap();
        let compiler = compiler_in(&tmp);
        let id = ScriptId::from_raw(7);

        // Fake an existing artifact and its metadata.
        fs::create_dir_all(&compiler.config.build_dir).unwrap();
        fs::create_dir_all(&compiler.config.cache_dir).unwrap();
        fs::write(compiler.artifact_path(id, OptimizationLevel::Debug), b"x").unwrap();
        fs::write(compiler.meta_path(id, OptimizationLevel::Debug), "11\n22").unwrap();

        let hit = compiler.check_cache(id, OptimizationLevel::Debug, 11, 22);
        assert!(hit.is_some());
        let cached = hit.unwrap();
        assert_eq!(cached.entry_symbol, "quill_entry_7");
        assert_eq!(cached.compile_time_ms, 0);

        assert!(compiler.check_cache(id, OptimizationLevel::Debug, 11, 99).is_none());
        assert!(compiler.check_cache(id, OptimizationLevel::Release, 11, 22).is_none());
    }

    #[test]
    fn test_artifact_paths_separate_optimization_levels() {
        let tmp = TempDir::new().unwrap();
        let compiler = compiler_in(&tmp);
        let id = ScriptId::from_raw(3);

        let debug = compiler.artifact_path(id, OptimizationLevel::Debug);
        let release = compiler.artifact_path(id, OptimizationLevel::Release);
        assert_ne!(debug, release);
        assert!(debug.to_string_lossy().contains("script_3_debug"));
        assert!(release.to_string_lossy().contains("script_3_release"));
    }

    #[test]
    #[ignore = "Requires rustc"]
    fn test_compile_simple_script() {
        let tmp = TempDir::new().unwrap();
        let compiler = compiler_in(&tmp);
        let unit = make_unit(1, "let x = 40;\nx + 2");

        let outcome = compiler.compile(&unit, &[], &ReferenceSet::empty(), OptimizationLevel::Debug);

        assert!(outcome.is_success(), "compile failed: {outcome:?}");
        let artifact = outcome.artifact().unwrap();
        assert!(artifact.dylib_path.exists());
        assert_eq!(artifact.entry_symbol, "quill_entry_1");

        // Second compile with identical inputs hits the cache.
        let again = compiler.compile(&unit, &[], &ReferenceSet::empty(), OptimizationLevel::Debug);
        assert!(matches!(again, CompileOutcome::Cached(_)));
    }

    #[test]
    #[ignore = "Requires rustc"]
    fn test_compile_failure_maps_to_original_lines() {
        let tmp = TempDir::new().unwrap();
        let compiler = compiler_in(&tmp);
        let unit = make_unit(1, "let x = 1;\nlet y: i32 = \"oops\";");

        let outcome = compiler.compile(&unit, &[], &ReferenceSet::empty(), OptimizationLevel::Debug);

        let CompileOutcome::Failed { diagnostics } = outcome else {
            panic!("expected failure");
        };
        let error = diagnostics.iter().find(|d| d.is_error()).unwrap();
        assert_eq!(error.location.as_ref().unwrap().line, 2);
    }

    #[test]
    #[ignore = "Requires rustc"]
    fn test_suppressed_warning_is_filtered() {
        let tmp = TempDir::new().unwrap();
        let compiler = compiler_in(&tmp);

        let noisy = make_unit(1, "let unused = 3;\n1 + 1");
        let outcome = compiler.compile(&noisy, &[], &ReferenceSet::empty(), OptimizationLevel::Debug);
        let CompileOutcome::Success { diagnostics, .. } = outcome else {
            panic!("expected success");
        };
        assert!(diagnostics.iter().any(|d| d.code.as_deref() == Some("unused_variables")));

        let quiet = CompilationUnit::from_args(
            ScriptId::from_raw(2),
            OpenArgs::new("let unused = 3;\n1 + 1", "/tmp/quill-test")
                .with_suppressions(vec!["unused_variables".to_string()]),
        );
        let outcome = compiler.compile(&quiet, &[], &ReferenceSet::empty(), OptimizationLevel::Debug);
        let CompileOutcome::Success { diagnostics, .. } = outcome else {
            panic!("expected success");
        };
        assert!(diagnostics.iter().all(|d| d.code.as_deref() != Some("unused_variables")));
    }
}
