//! Check command: compile a script and report diagnostics without
//! running it.

use std::path::Path;

use anyhow::Context;

use quill_core::{
    CompileOutcome, CompilerConfig, DependencyResolver, Diagnostic, DirectiveParser, OpenArgs,
    OptimizationLevel, ParseMode, PlatformCatalog, ReferenceSet, ScriptCompiler, ScriptDirs,
    WorkspaceRegistry,
};

use crate::colors;
use crate::run::script_working_dir;

pub fn execute(script: &str, release: bool, program: bool) -> anyhow::Result<i32> {
    let path = Path::new(script);
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let working_dir = script_working_dir(path)?;

    let catalog = PlatformCatalog::detect()?;

    let mut args = OpenArgs::new(source.as_str(), &working_dir);
    if program {
        args = args.with_mode(ParseMode::Program);
    }
    let registry = WorkspaceRegistry::new();
    let unit = registry.get(registry.open(args)?)?;

    // Restore comes first: diagnostics for scripts with references depend
    // on the generated dependency crate being present.
    let requests = DirectiveParser::parse(&source);
    let references = if requests.is_empty() {
        ReferenceSet::empty()
    } else {
        eprintln!(
            "{}Restoring{} {} package(s)",
            colors::CYAN,
            colors::RESET,
            requests.len()
        );
        let resolver = DependencyResolver::new(&working_dir, catalog.cargo_path().clone())?;
        let outcome = resolver.resolve(&requests, false)?;
        if !outcome.success {
            for error in &outcome.errors {
                eprintln!("{}error{}: {error}", colors::RED, colors::RESET);
            }
            return Ok(1);
        }
        outcome.references
    };

    let dirs = ScriptDirs::from_working_dir(&unit.working_dir)?;
    let mut config = CompilerConfig::for_workspace(&dirs);
    let optimization = if release {
        OptimizationLevel::Release
    } else {
        OptimizationLevel::Debug
    };
    config.debug_info = optimization == OptimizationLevel::Debug;
    let compiler = ScriptCompiler::new(config, catalog.rustc_path().clone());

    match compiler.compile(&unit, &[], &references, optimization) {
        CompileOutcome::Failed { diagnostics } => {
            print_diagnostics(&diagnostics);
            let errors = diagnostics.iter().filter(|d| d.is_error()).count();
            eprintln!(
                "{}error{}: could not compile {} ({errors} error{})",
                colors::RED,
                colors::RESET,
                path.display(),
                if errors == 1 { "" } else { "s" },
            );
            Ok(1)
        }
        CompileOutcome::Success { diagnostics, .. } => {
            print_diagnostics(&diagnostics);
            println!("{}Finished{} {}", colors::GREEN, colors::RESET, path.display());
            Ok(0)
        }
        CompileOutcome::Cached(_) => {
            println!(
                "{}Finished{} {} (cached)",
                colors::GREEN,
                colors::RESET,
                path.display()
            );
            Ok(0)
        }
    }
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        match &diagnostic.rendered {
            Some(text) => {
                eprint!("{text}");
                if !text.ends_with('\n') {
                    eprintln!();
                }
            }
            None => eprint!("{}", diagnostic.format_terminal()),
        }
    }
}
