//! Integration tests for the execution host.
//!
//! The hermetic tests exercise the workspace surface and event stream
//! plumbing with at most one rustc invocation. Tests that execute
//! scripts need a built `quill-runner` binary and are ignored by
//! default; run them with `cargo build -p quill-runner && cargo test
//! -p quill-host -- --ignored`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use quill_core::{Error as CoreError, OpenArgs, ScriptId};
use quill_host::{ExecutionEvent, ExecutionHost, HostConfig, HostError, RunPhase, RunRequest};

// ============================================================================
// Test helpers
// ============================================================================

/// Working directory for one test script, removed on drop.
struct ScriptDir {
    path: PathBuf,
}

impl ScriptDir {
    fn new() -> Self {
        let path = std::env::temp_dir()
            .join("quill_host_tests")
            .join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&path).expect("Failed to create script directory");
        Self { path }
    }

    fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for ScriptDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn host() -> ExecutionHost {
    ExecutionHost::with_defaults().expect("Toolchain should be detected")
}

/// Host for runs that fault before the Running stage.
///
/// The placeholder runner path satisfies platform resolution without
/// requiring a built `quill-runner` binary; nothing is ever spawned.
fn compile_only_host() -> ExecutionHost {
    let config = HostConfig {
        runner_path: Some(PathBuf::from("/nonexistent/quill-runner")),
        ..HostConfig::default()
    };
    ExecutionHost::new(config).expect("Toolchain should be detected")
}

/// Host wired to the runner binary produced by `cargo build -p quill-runner`.
fn host_with_runner() -> ExecutionHost {
    let mut path = std::env::current_exe().expect("Test binary path should be known");
    path.pop(); // deps/
    path.pop();
    path.push(format!("quill-runner{}", std::env::consts::EXE_SUFFIX));
    assert!(
        path.exists(),
        "quill-runner not found at {}; run `cargo build -p quill-runner` first",
        path.display()
    );

    let config = HostConfig {
        runner_path: Some(path),
        ..HostConfig::default()
    };
    ExecutionHost::new(config).expect("Toolchain should be detected")
}

/// Drain events until the first terminal event.
async fn collect_run(rx: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    loop {
        match timeout(Duration::from_secs(120), rx.recv()).await {
            Ok(Ok(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
            Ok(Err(e)) => panic!("Event stream ended before a terminal event: {e}"),
            Err(_) => panic!("Timed out waiting for a terminal event; saw {events:?}"),
        }
    }
}

/// All output text of a run, concatenated.
fn output_text(events: &[ExecutionEvent]) -> String {
    let mut text = String::new();
    for event in events {
        if let ExecutionEvent::Output { text: chunk } = event {
            text.push_str(chunk);
        }
    }
    text
}

async fn wait_for_phase(host: &ExecutionHost, id: ScriptId, wanted: RunPhase) {
    for _ in 0..600 {
        if host.phase(id).await.expect("Script should be open") == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Script never reached {wanted:?}");
}

// ============================================================================
// Workspace surface
// ============================================================================

#[tokio::test]
async fn test_open_update_snapshot_close() {
    let dir = ScriptDir::new();
    let host = host();

    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");
    assert!(host.contains(id));
    assert_eq!(host.open_count(), 1);
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Idle);

    let before = host.snapshot(id).expect("Snapshot should exist");
    assert_eq!(&*before.source, "1 + 1");

    host.update(id, "2 + 2").expect("Update should succeed");
    let after = host.snapshot(id).expect("Snapshot should exist");
    assert_eq!(&*after.source, "2 + 2");
    // Snapshots taken before the update are unaffected.
    assert_eq!(&*before.source, "1 + 1");

    host.close(id).await.expect("Close should succeed");
    assert!(!host.contains(id));
    assert_eq!(host.open_count(), 0);
}

#[tokio::test]
async fn test_close_refused_while_referenced() {
    let dir = ScriptDir::new();
    let host = host();

    let parent = host
        .open(OpenArgs::new("fn shared() -> i32 { 7 }", dir.path()))
        .await
        .expect("Open should succeed");
    let child = host
        .open_related(parent, OpenArgs::new("shared() + 1", dir.path()))
        .await
        .expect("Related open should succeed");

    let refused = host.close(parent).await;
    assert!(
        matches!(
            refused,
            Err(HostError::Core(CoreError::DocumentReferenced(id))) if id == parent
        ),
        "Close of a referenced script must be refused"
    );
    assert!(host.contains(parent), "Refused close must not drop the script");

    host.close(child).await.expect("Child close should succeed");
    host.close(parent).await.expect("Parent close should succeed now");
    assert_eq!(host.open_count(), 0);
}

#[tokio::test]
async fn test_operations_on_closed_script_fail() {
    let dir = ScriptDir::new();
    let host = host();

    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");
    host.close(id).await.expect("Close should succeed");

    assert!(host.snapshot(id).is_err());
    assert!(host.subscribe(id).await.is_err());
    assert!(host.run(id, RunRequest::new()).await.is_err());
    assert!(host.phase(id).await.is_err());
    assert!(host.terminate(id).await.is_err());
}

// ============================================================================
// Stream and state behavior without execution
// ============================================================================

#[tokio::test]
async fn test_subscription_starts_empty() {
    let dir = ScriptDir::new();
    let host = host();
    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");

    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_input_without_pending_request_is_ignored() {
    let dir = ScriptDir::new();
    let host = host();
    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");

    host.send_input(id, "nobody asked").await.expect("Input should be accepted");
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Idle);
}

#[tokio::test]
async fn test_terminate_idle_is_noop() {
    let dir = ScriptDir::new();
    let host = host();
    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");

    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");
    host.terminate(id).await.expect("Terminate should succeed");

    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Idle);
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_unknown_platform_is_rejected_synchronously() {
    let dir = ScriptDir::new();
    let host = host();
    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    let request = RunRequest::new().with_platform("riscv128gc-unknown-none");
    let result = host.run(id, request).await;

    assert!(matches!(
        result,
        Err(HostError::Core(CoreError::UnknownPlatform(_)))
    ));
    // The failed request leaves no trace on the stream.
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Idle);
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_update_references_accepted_while_idle() {
    let dir = ScriptDir::new();
    let host = host();
    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");

    host.update_references(id, false).await.expect("Mark should succeed");
    host.update_references(id, true).await.expect("Mark should succeed");
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Idle);
}

// ============================================================================
// Compilation pipeline (rustc, but no runner process)
// ============================================================================

#[tokio::test]
async fn test_compile_error_faults_with_diagnostics() {
    let dir = ScriptDir::new();
    let host = compile_only_host();
    let id = host
        .open(OpenArgs::new("let x: i32 = \"oops\";", dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");
    let events = collect_run(&mut rx).await;

    assert!(
        matches!(events.last(), Some(ExecutionEvent::Faulted { error: None })),
        "Compile errors should fault without a process-level error, got {events:?}"
    );

    let diagnostics = events.iter().find_map(|event| match event {
        ExecutionEvent::CompilationDiagnostics { diagnostics } => Some(diagnostics),
        _ => None,
    });
    let diagnostics = diagnostics.expect("Diagnostics should be emitted before the fault");
    assert!(diagnostics.iter().any(|d| d.severity == "error"));

    // No restore for a dependency-free script, and nothing ran.
    assert!(!events.iter().any(|e| matches!(e, ExecutionEvent::RestoreStarted)));
    assert!(output_text(&events).is_empty());
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Faulted);
}

#[tokio::test]
async fn test_terminate_before_running_cancels() {
    let dir = ScriptDir::new();
    let host = compile_only_host();
    let id = host
        .open(OpenArgs::new("1 + 1", dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");
    host.terminate(id).await.expect("Terminate should be accepted");

    let events = collect_run(&mut rx).await;
    // A process start would have faulted on the placeholder runner
    // path, so a Cancelled terminal also proves nothing was spawned.
    assert!(
        matches!(events.last(), Some(ExecutionEvent::Cancelled)),
        "Terminate during an early stage should cancel, got {events:?}"
    );
    assert!(output_text(&events).is_empty());
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Cancelled);
}

// ============================================================================
// End-to-end execution (requires a built quill-runner binary)
// ============================================================================

#[tokio::test]
#[ignore = "Requires a built quill-runner binary"]
async fn test_expression_script_prints_its_value() {
    let dir = ScriptDir::new();
    let host = host_with_runner();
    let id = host
        .open(OpenArgs::new("40 + 2", dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");
    let events = collect_run(&mut rx).await;

    assert!(matches!(events.last(), Some(ExecutionEvent::Completed)));
    assert!(output_text(&events).contains("42"));
    assert!(!events.iter().any(|e| matches!(e, ExecutionEvent::RestoreStarted)));
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Completed);
}

#[tokio::test]
#[ignore = "Requires a built quill-runner binary"]
async fn test_runtime_panic_still_completes() {
    let dir = ScriptDir::new();
    let host = host_with_runner();
    let id = host
        .open(OpenArgs::new("panic!(\"boom\");", dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");
    let events = collect_run(&mut rx).await;

    // A panic is the script's failure, not the pipeline's.
    assert!(matches!(events.last(), Some(ExecutionEvent::Completed)));
    let runtime_error = events.iter().find_map(|event| match event {
        ExecutionEvent::RuntimeError { message } => Some(message.as_str()),
        _ => None,
    });
    assert!(
        runtime_error.is_some_and(|m| m.contains("boom")),
        "Panic text should surface as a runtime error, got {events:?}"
    );
}

#[tokio::test]
#[ignore = "Requires a built quill-runner binary"]
async fn test_read_line_round_trip() {
    let dir = ScriptDir::new();
    let host = host_with_runner();
    let source = "let line = read_line();\n\
                  let n: i32 = line.trim().parse().unwrap_or(0);\n\
                  println!(\"twice {}\", n * 2);";
    let id = host
        .open(OpenArgs::new(source, dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");

    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("Timed out waiting for events")
            .expect("Event stream should stay open");
        if matches!(event, ExecutionEvent::InputRequested) {
            host.send_input(id, "21").await.expect("Input should be delivered");
        }
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    assert!(matches!(events.last(), Some(ExecutionEvent::Completed)));
    assert!(events.iter().any(|e| matches!(e, ExecutionEvent::InputRequested)));
    assert!(output_text(&events).contains("twice 42"));
}

#[tokio::test]
#[ignore = "Requires a built quill-runner binary"]
async fn test_terminate_cancels_running_script() {
    let dir = ScriptDir::new();
    let host = host_with_runner();
    let source = "loop { std::thread::sleep(std::time::Duration::from_millis(50)); }";
    let id = host
        .open(OpenArgs::new(source, dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");
    wait_for_phase(&host, id, RunPhase::Running).await;

    host.terminate(id).await.expect("Terminate should succeed");

    let events = collect_run(&mut rx).await;
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "A run gets exactly one terminal event");
    assert!(matches!(events.last(), Some(ExecutionEvent::Cancelled)));
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Cancelled);
}

#[tokio::test]
#[ignore = "Requires a built quill-runner binary"]
async fn test_new_run_supersedes_active_run() {
    let dir = ScriptDir::new();
    let host = host_with_runner();
    let source = "loop { std::thread::sleep(std::time::Duration::from_millis(50)); }";
    let id = host
        .open(OpenArgs::new(source, dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");
    wait_for_phase(&host, id, RunPhase::Running).await;

    host.update(id, "7 * 6").expect("Update should succeed");
    host.run(id, RunRequest::new()).await.expect("Second run should start");

    // The superseded run ends in its own Cancelled before the new run's
    // events begin.
    let first = collect_run(&mut rx).await;
    assert!(matches!(first.last(), Some(ExecutionEvent::Cancelled)));

    let second = collect_run(&mut rx).await;
    assert!(matches!(second.last(), Some(ExecutionEvent::Completed)));
    assert!(output_text(&second).contains("42"));
}

#[tokio::test]
#[ignore = "Resolves dependencies against the real crates.io index"]
async fn test_missing_package_faults_before_compile() {
    let dir = ScriptDir::new();
    let host = compile_only_host();
    let source = "//! ```cargo\n\
                  //! [dependencies]\n\
                  //! quill-no-such-package-x9y8z7 = \"99.99\"\n\
                  //! ```\n\
                  1 + 1";
    let id = host
        .open(OpenArgs::new(source, dir.path()))
        .await
        .expect("Open should succeed");
    let mut rx = host.subscribe(id).await.expect("Subscribe should succeed");

    host.run(id, RunRequest::new()).await.expect("Run should start");
    let events = collect_run(&mut rx).await;

    assert!(events.iter().any(|e| matches!(e, ExecutionEvent::RestoreStarted)));
    let restore = events.iter().find_map(|event| match event {
        ExecutionEvent::RestoreCompleted { success, errors } => Some((*success, errors.clone())),
        _ => None,
    });
    let (success, errors) = restore.expect("Restore completion should be reported");
    assert!(!success);
    assert!(!errors.is_empty());

    assert!(
        events.iter().any(|e| matches!(e, ExecutionEvent::CompilationDiagnostics { .. })),
        "Restore errors should surface as diagnostics"
    );
    assert!(matches!(events.last(), Some(ExecutionEvent::Faulted { .. })));
    assert!(output_text(&events).is_empty(), "The script must not run");
    assert_eq!(host.phase(id).await.unwrap(), RunPhase::Faulted);
}
