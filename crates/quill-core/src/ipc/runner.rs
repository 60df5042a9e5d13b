//! Runner process management for script execution.
//!
//! Provides `RunnerHandle` for spawning and talking to isolated runner
//! processes, `RunnerPool` for warm reuse, and thread-safe side handles
//! for input delivery and hard kills while the event stream is being
//! read.

use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};

use super::protocol::{RunnerCommand, RunnerEvent, read_frame, write_frame};

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Ipc(format!("runner stdin lock poisoned (thread panicked): {e}"))
}

/// Handle to a runner process.
///
/// Commands go through a shared stdin writer so input can be delivered
/// while the owning thread is blocked reading events.
pub struct RunnerHandle {
    /// Spawned runner process.
    child: Child,
    /// Shared buffered stdin writer.
    stdin: Arc<Mutex<BufWriter<ChildStdin>>>,
    /// Buffered stdout reader. Only the handle owner reads events.
    stdout: BufReader<ChildStdout>,
    /// Whether the runner has been killed through this handle.
    killed: bool,
}

impl RunnerHandle {
    /// Spawn a runner process from an explicit binary path.
    ///
    /// The process starts in the host's working directory; each `Run`
    /// command carries the script's own directory.
    pub fn spawn(runner_path: &Path) -> Result<Self> {
        let mut child = Command::new(runner_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let runner stderr pass through for debugging
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn runner process '{}': {}",
                    runner_path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get runner stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get runner stdout".to_string()))?;

        let mut handle = Self {
            child,
            stdin: Arc::new(Mutex::new(BufWriter::new(stdin))),
            stdout: BufReader::new(stdout),
            killed: false,
        };

        // Verify the runner is alive with a ping
        handle.send_command(&RunnerCommand::Ping)?;
        match handle.recv_event()? {
            RunnerEvent::Pong => Ok(handle),
            other => Err(Error::Ipc(format!(
                "Unexpected event from runner: {:?}",
                other
            ))),
        }
    }

    /// Send a command to the runner.
    pub fn send_command(&self, cmd: &RunnerCommand) -> Result<()> {
        if self.killed {
            return Err(Error::Ipc("Runner has been killed".to_string()));
        }
        let mut stdin = self.stdin.lock().map_err(lock_error)?;
        write_frame(&mut *stdin, cmd)
    }

    /// Receive the next event from the runner. Blocks.
    pub fn recv_event(&mut self) -> Result<RunnerEvent> {
        if self.killed {
            return Err(Error::Ipc("Runner has been killed".to_string()));
        }
        read_frame(&mut self.stdout)
    }

    /// Thread-safe handle for delivering input lines.
    pub fn input_handle(&self) -> RunnerInputHandle {
        RunnerInputHandle {
            stdin: Arc::clone(&self.stdin),
        }
    }

    /// Thread-safe handle for killing this runner.
    pub fn kill_handle(&self) -> RunnerKillHandle {
        RunnerKillHandle {
            pid: self.pid(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kill the runner process.
    ///
    /// This is the interruption path: the process is terminated without
    /// any cooperation from the script.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }

        // Ask for a graceful exit first, then escalate.
        let _ = self.send_command(&RunnerCommand::Shutdown);
        self.killed = true;
        std::thread::sleep(Duration::from_millis(10));

        // A runner that honored the request only needs reaping.
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::warn!("Failed to kill runner: {e}");
        }
        let _ = self.child.wait();
    }

    /// Check if the runner process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Get the process ID of the runner.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Graceful shutdown: ask the runner to exit cleanly.
    pub fn shutdown(mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }

        let _ = self.send_command(&RunnerCommand::Shutdown);

        let status = self
            .child
            .wait()
            .map_err(|e| Error::Ipc(format!("Failed to wait for runner: {e}")))?;
        self.killed = true;
        if !status.success() {
            return Err(Error::Ipc(format!("Runner exited with status: {status}")));
        }
        Ok(())
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Thread-safe handle for delivering input to a running script.
#[derive(Clone)]
pub struct RunnerInputHandle {
    /// Shared stdin writer of the runner process.
    stdin: Arc<Mutex<BufWriter<ChildStdin>>>,
}

impl RunnerInputHandle {
    /// Deliver one line of input.
    ///
    /// Errors mean the runner is gone; the event loop notices that
    /// separately.
    pub fn send(&self, text: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().map_err(lock_error)?;
        write_frame(
            &mut *stdin,
            &RunnerCommand::Input {
                text: text.to_string(),
            },
        )
    }

    /// Ask the runner to exit once it has flushed pending events.
    ///
    /// The graceful half of cancellation; callers escalate to a
    /// [`RunnerKillHandle`] when the runner does not wind down in time.
    pub fn request_shutdown(&self) -> Result<()> {
        let mut stdin = self.stdin.lock().map_err(lock_error)?;
        write_frame(&mut *stdin, &RunnerCommand::Shutdown)
    }
}

/// Thread-safe handle for killing a runner from another thread.
///
/// Held by cancellation watchers so they can escalate without access
/// to the owning [`RunnerHandle`].
#[derive(Clone)]
pub struct RunnerKillHandle {
    /// Process ID of the runner.
    pid: u32,
    /// Set once a kill has been issued through this handle.
    killed: Arc<AtomicBool>,
}

impl RunnerKillHandle {
    /// Kill the runner process.
    ///
    /// Can be called from any thread; terminates the process
    /// immediately.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return; // Already killed
        }

        #[cfg(unix)]
        {
            // SIGKILL; the script gets no chance to block it.
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
            }
        }

        #[cfg(windows)]
        {
            use windows_sys::Win32::Foundation::CloseHandle;
            use windows_sys::Win32::System::Threading::{
                OpenProcess, PROCESS_TERMINATE, TerminateProcess,
            };

            unsafe {
                let handle = OpenProcess(PROCESS_TERMINATE, 0, self.pid);
                if !handle.is_null() {
                    TerminateProcess(handle, 1);
                    CloseHandle(handle);
                }
            }
        }
    }

    /// Check if a kill has been requested.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Pool of reusable runner processes.
///
/// Maintains warm runners to avoid spawn overhead. Runners are recycled
/// only after a clean finish; interrupted ones are killed.
pub struct RunnerPool {
    /// Available runners ready for use.
    available: Vec<RunnerHandle>,
    /// Upper bound on retained runners.
    max_size: usize,
}

impl RunnerPool {
    /// Create a new runner pool.
    pub fn new(max_size: usize) -> Self {
        Self {
            available: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Create a pool and pre-warm with N runners.
    pub fn with_warm_runners(runner_path: &Path, max_size: usize, warm_count: usize) -> Result<Self> {
        let mut pool = Self::new(max_size);
        for _ in 0..warm_count.min(max_size) {
            let runner = RunnerHandle::spawn(runner_path)?;
            pool.available.push(runner);
        }
        Ok(pool)
    }

    /// Get a runner from the pool, spawning if necessary.
    pub fn get(&mut self, runner_path: &Path) -> Result<RunnerHandle> {
        // Try to reuse an existing runner
        while let Some(mut runner) = self.available.pop() {
            if runner.is_alive() {
                return Ok(runner);
            }
            // Runner died, try the next one
        }

        RunnerHandle::spawn(runner_path)
    }

    /// Return a runner to the pool for reuse.
    ///
    /// If the pool is full, the runner is dropped (killed).
    pub fn put(&mut self, mut runner: RunnerHandle) {
        if !runner.is_alive() {
            return;
        }

        if self.available.len() < self.max_size {
            self.available.push(runner);
        }
        // Otherwise the runner is dropped and killed
    }

    /// Kill all runners in the pool.
    pub fn shutdown(&mut self) {
        for mut runner in self.available.drain(..) {
            runner.kill();
        }
    }

    /// Get the number of available runners.
    pub fn available_count(&self) -> usize {
        self.available.len()
    }
}

impl Drop for RunnerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
