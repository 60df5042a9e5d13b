//! Isolated script runner.
//!
//! Spawned by the host with the IPC protocol on stdin/stdout. The first
//! thing it does is rewire those descriptors so script code cannot
//! corrupt the protocol stream; see [`capture`] for the details. All
//! logging goes to stderr, which the host inherits.

use std::io::BufReader;

use tracing_subscriber::EnvFilter;

use quill_core::ipc::{RunnerCommand, RunnerEvent, read_frame};

mod capture;
mod events;
mod execute;

use events::EventWriter;
use execute::ScriptExecutor;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let stdio = capture::redirect()?;
    let events = EventWriter::new(stdio.events);
    if let Some(captured) = stdio.captured {
        capture::spawn_forwarder(captured, events.clone());
    }

    let mut commands = BufReader::new(stdio.commands);
    let executor = ScriptExecutor::new(events.clone());

    tracing::debug!("Runner started, pid {}", std::process::id());

    loop {
        let command: RunnerCommand = match read_frame(&mut commands) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!("Command stream closed: {}", e);
                break;
            }
        };

        match command {
            RunnerCommand::Ping => events.send(RunnerEvent::Pong),
            RunnerCommand::Input { text } => executor.deliver_input(text),
            RunnerCommand::Run {
                artifact_path,
                entry_symbol,
                script_name,
                working_dir,
            } => executor.start_run(artifact_path, entry_symbol, script_name, working_dir),
            RunnerCommand::Shutdown => {
                events.send(RunnerEvent::ShuttingDown);
                break;
            }
        }
    }

    Ok(())
}
