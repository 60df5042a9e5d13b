//! Platforms command: show the detected toolchain and execution
//! platforms.

use quill_core::PlatformCatalog;

use crate::colors;

pub fn execute() -> anyhow::Result<()> {
    let catalog = PlatformCatalog::detect()?;

    println!("{}Toolchain{}", colors::BOLD, colors::RESET);
    println!("  {}", catalog.version());
    println!("  rustc: {}", catalog.rustc_path().display());
    println!("  cargo: {}", catalog.cargo_path().display());
    println!();

    println!("{}Execution platforms{}", colors::BOLD, colors::RESET);
    if catalog.platforms().is_empty() {
        println!(
            "  {}none{} (no quill-runner binary found; compile-only mode)",
            colors::YELLOW,
            colors::RESET
        );
        return Ok(());
    }

    for platform in catalog.platforms() {
        let marker = if platform.id == catalog.host_triple() {
            " (host)"
        } else {
            ""
        };
        println!(
            "  {}{}{}{}",
            colors::GREEN,
            platform.id,
            colors::RESET,
            marker
        );
        println!("    runner: {}", platform.runner_path.display());
    }

    Ok(())
}
