//! Quill CLI - Rust scripts with inline dependencies.

mod check;
mod colors;
mod platforms;
mod run;

use std::io::Write;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Run Rust script files with inline dependency declarations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose log output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a script
    Run {
        /// Path to the script (.rs file)
        script: String,

        /// Compile with optimizations
        #[arg(long)]
        release: bool,

        /// Treat the file as a full program with its own `fn main`
        #[arg(long)]
        program: bool,

        /// Print the compiled assembly after the run
        #[arg(long)]
        asm: bool,

        /// Execution platform identifier (defaults to the host)
        #[arg(long)]
        platform: Option<String>,

        /// Emit events as JSON lines instead of formatted text
        #[arg(long)]
        json: bool,
    },

    /// Compile a script and report diagnostics without running it
    Check {
        /// Path to the script (.rs file)
        script: String,

        /// Compile with optimizations
        #[arg(long)]
        release: bool,

        /// Treat the file as a full program with its own `fn main`
        #[arg(long)]
        program: bool,
    },

    /// Show the detected toolchain and execution platforms
    Platforms,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let code = match cli.command {
        Commands::Run {
            script,
            release,
            program,
            asm,
            platform,
            json,
        } => {
            run::execute(run::RunArgs {
                script,
                release,
                program,
                asm,
                platform,
                json,
            })
            .await?
        }

        Commands::Check {
            script,
            release,
            program,
        } => check::execute(&script, release, program)?,

        Commands::Platforms => {
            platforms::execute()?;
            0
        }
    };

    // exit() skips buffered-writer destructors.
    let _ = std::io::stdout().flush();
    std::process::exit(code);
}
