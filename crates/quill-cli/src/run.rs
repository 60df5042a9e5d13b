//! Run command: execute a script through the host and stream its events
//! to the terminal.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;

use quill_core::{OpenArgs, ParseMode};
use quill_host::{ExecutionEvent, ExecutionHost, HostConfig, RunRequest};

use crate::colors;

/// Exit code for a run cancelled from the terminal.
const EXIT_INTERRUPTED: i32 = 130;

pub struct RunArgs {
    pub script: String,
    pub release: bool,
    pub program: bool,
    pub asm: bool,
    pub platform: Option<String>,
    pub json: bool,
}

pub async fn execute(args: RunArgs) -> anyhow::Result<i32> {
    let path = Path::new(&args.script);
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let working_dir = script_working_dir(path)?;

    let host = ExecutionHost::new(HostConfig::default())?;

    let mut open_args = OpenArgs::new(source, working_dir);
    if args.program {
        open_args = open_args.with_mode(ParseMode::Program);
    }
    let id = host.open(open_args).await?;
    let mut events = host.subscribe(id).await?;

    let mut request = RunRequest::new();
    if args.release {
        request = request.release();
    }
    if args.asm {
        request = request.with_disassembly();
    }
    if let Some(platform) = &args.platform {
        request = request.with_platform(platform.clone());
    }

    let start = Instant::now();
    host.run(id, request).await?;

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interrupted = false;
    let mut renderer = Renderer {
        json: args.json,
        saw_runtime_error: false,
    };

    let terminal = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    renderer.render(&event)?;
                    if event.is_terminal() {
                        break event;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    eprintln!(
                        "{}warning{}: dropped {missed} event(s), terminal too slow",
                        colors::YELLOW,
                        colors::RESET
                    );
                }
                Err(RecvError::Closed) => {
                    anyhow::bail!("Event stream closed before the run finished");
                }
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => host.send_input(id, &line).await?,
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                host.terminate(id).await?;
            }
        }
    };

    if !args.json {
        print_summary(&terminal, renderer.saw_runtime_error, start.elapsed());
    }
    let exit = match &terminal {
        ExecutionEvent::Completed if renderer.saw_runtime_error => 1,
        ExecutionEvent::Completed => 0,
        ExecutionEvent::Cancelled => EXIT_INTERRUPTED,
        _ => 1,
    };

    host.close(id).await?;
    Ok(exit)
}

/// Directory the script executes in: its parent directory, resolved to
/// an absolute path.
pub(crate) fn script_working_dir(path: &Path) -> anyhow::Result<PathBuf> {
    let absolute = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let parent = absolute
        .parent()
        .context("Script path has no parent directory")?;
    Ok(parent.to_path_buf())
}

struct Renderer {
    json: bool,
    saw_runtime_error: bool,
}

impl Renderer {
    fn render(&mut self, event: &ExecutionEvent) -> anyhow::Result<()> {
        if matches!(event, ExecutionEvent::RuntimeError { .. }) {
            self.saw_runtime_error = true;
        }
        if self.json {
            println!("{}", serde_json::to_string(event)?);
            let _ = std::io::stdout().flush();
            return Ok(());
        }
        match event {
            ExecutionEvent::RestoreStarted => {
                eprintln!("{}Restoring{} packages...", colors::CYAN, colors::RESET);
            }
            ExecutionEvent::RestoreCompleted { success: true, .. } => {
                eprintln!("{}Restored{}", colors::GREEN, colors::RESET);
            }
            ExecutionEvent::RestoreCompleted { success: false, errors } => {
                for error in errors {
                    eprintln!("{}error{}: {error}", colors::RED, colors::RESET);
                }
            }
            ExecutionEvent::CompilationDiagnostics { diagnostics } => {
                for diagnostic in diagnostics {
                    match &diagnostic.rendered {
                        Some(text) => {
                            eprint!("{text}");
                            if !text.ends_with('\n') {
                                eprintln!();
                            }
                        }
                        None => eprintln!(
                            "{}{}{}: {}",
                            severity_color(&diagnostic.severity),
                            diagnostic.severity,
                            colors::RESET,
                            diagnostic.message
                        ),
                    }
                }
            }
            ExecutionEvent::Output { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            ExecutionEvent::RuntimeError { message } => {
                eprint!("{}{message}{}", colors::RED, colors::RESET);
                if !message.ends_with('\n') {
                    eprintln!();
                }
            }
            // The script prints its own prompt; nothing to add here.
            ExecutionEvent::InputRequested => {}
            ExecutionEvent::Progress { percent } => {
                eprint!("\r{}{percent:>5.1}%{}", colors::DIM, colors::RESET);
                if *percent >= 100.0 {
                    eprintln!();
                }
            }
            ExecutionEvent::Disassembly { text } => {
                println!("\n{}Assembly{}", colors::BOLD, colors::RESET);
                println!("{}", "─".repeat(50));
                println!("{text}");
            }
            ExecutionEvent::Completed
            | ExecutionEvent::Faulted { .. }
            | ExecutionEvent::Cancelled => {}
        }
        Ok(())
    }
}

fn print_summary(event: &ExecutionEvent, saw_runtime_error: bool, elapsed: Duration) {
    match event {
        ExecutionEvent::Completed if saw_runtime_error => eprintln!(
            "\n{}Completed with errors{} in {:.2}s",
            colors::YELLOW,
            colors::RESET,
            elapsed.as_secs_f64()
        ),
        ExecutionEvent::Completed => eprintln!(
            "\n{}Completed{} in {:.2}s",
            colors::GREEN,
            colors::RESET,
            elapsed.as_secs_f64()
        ),
        ExecutionEvent::Faulted { error: Some(error) } => {
            eprintln!("\n{}Failed{}: {error}", colors::RED, colors::RESET);
        }
        ExecutionEvent::Faulted { error: None } => {
            eprintln!("\n{}Failed{}", colors::RED, colors::RESET);
        }
        ExecutionEvent::Cancelled => {
            eprintln!("\n{}Cancelled{}", colors::YELLOW, colors::RESET);
        }
        _ => {}
    }
}

fn severity_color(severity: &str) -> &'static str {
    match severity {
        "error" => colors::RED,
        "warning" => colors::YELLOW,
        _ => colors::DIM,
    }
}
