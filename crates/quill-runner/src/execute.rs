//! Script loading and execution.
//!
//! Each `Run` command loads the compiled artifact, hands the entry
//! function a hook table, and streams whatever the hooks report back to
//! the host. Runs execute on their own thread so the command loop stays
//! responsive for `Input` and `Shutdown`.

use std::ffi::c_void;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use libloading::{Library, Symbol};

use quill_core::abi::{EntryStatus, HostHooks, READ_LINE_BUF_CAP, ScriptEntryFn};
use quill_core::ipc::RunnerEvent;

use crate::events::{EventWriter, lock};

/// Executes scripts one at a time on dedicated threads.
pub struct ScriptExecutor {
    /// Event stream back to the host.
    events: EventWriter,
    /// Input sender for the active run, if any.
    input_tx: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    /// Whether a run is in flight.
    busy: Arc<AtomicBool>,
    /// Loaded artifacts. Never unloaded: script code may have leaked
    /// references (spawned threads, statics) that outlive the run.
    libraries: Arc<Mutex<Vec<Library>>>,
}

impl ScriptExecutor {
    pub fn new(events: EventWriter) -> Self {
        Self {
            events,
            input_tx: Arc::new(Mutex::new(None)),
            busy: Arc::new(AtomicBool::new(false)),
            libraries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start executing a compiled script.
    ///
    /// The host runs one script per runner; a second `Run` while busy is
    /// logged and dropped.
    pub fn start_run(
        &self,
        artifact_path: String,
        entry_symbol: String,
        script_name: String,
        working_dir: String,
    ) {
        if self.busy.swap(true, Ordering::SeqCst) {
            tracing::warn!("Run requested while a script is active; ignoring");
            return;
        }

        let (input_tx, input_rx) = mpsc::channel();
        *lock(&self.input_tx) = Some(input_tx);

        let events = self.events.clone();
        let busy = Arc::clone(&self.busy);
        let input_slot = Arc::clone(&self.input_tx);
        let libraries = Arc::clone(&self.libraries);

        std::thread::spawn(move || {
            run_script(
                &artifact_path,
                &entry_symbol,
                &script_name,
                &working_dir,
                input_rx,
                &events,
                &libraries,
            );

            *lock(&input_slot) = None;
            busy.store(false, Ordering::SeqCst);

            // Push whatever the script printed last and give the capture
            // thread a beat to drain before the terminal event.
            let _ = std::io::stdout().flush();
            std::thread::sleep(Duration::from_millis(20));

            events.send(RunnerEvent::Finished);
        });
    }

    /// Deliver one line of input to the active run.
    ///
    /// Dropped with a log line when no script is waiting; the host
    /// already gates input on an active run.
    pub fn deliver_input(&self, text: String) {
        match &*lock(&self.input_tx) {
            Some(tx) => {
                if tx.send(text).is_err() {
                    tracing::debug!("Input delivered after the run finished; dropped");
                }
            }
            None => tracing::debug!("Input with no active run; dropped"),
        }
    }
}

/// State shared with the C hooks for one run.
struct HookContext {
    events: EventWriter,
    input_rx: mpsc::Receiver<String>,
}

fn run_script(
    artifact_path: &str,
    entry_symbol: &str,
    script_name: &str,
    working_dir: &str,
    input_rx: mpsc::Receiver<String>,
    events: &EventWriter,
    libraries: &Mutex<Vec<Library>>,
) {
    if !working_dir.is_empty()
        && let Err(e) = std::env::set_current_dir(working_dir)
    {
        tracing::warn!("Failed to enter working directory {}: {}", working_dir, e);
    }

    // SAFETY: the artifact was produced by our own compiler; loading runs
    // its initializers.
    let library = match unsafe { Library::new(artifact_path) } {
        Ok(lib) => lib,
        Err(e) => {
            events.send(RunnerEvent::RuntimeError {
                message: format!("failed to load {script_name}: {e}"),
            });
            return;
        }
    };

    let status = {
        let entry: Symbol<ScriptEntryFn> = match unsafe { library.get(entry_symbol.as_bytes()) } {
            Ok(func) => func,
            Err(e) => {
                events.send(RunnerEvent::RuntimeError {
                    message: format!("entry symbol {entry_symbol} missing in {script_name}: {e}"),
                });
                lock(libraries).push(library);
                return;
            }
        };

        let mut ctx = HookContext {
            events: events.clone(),
            input_rx,
        };
        let hooks = HostHooks {
            context: &mut ctx as *mut HookContext as *mut c_void,
            dump: dump_hook,
            error: error_hook,
            read_line: read_line_hook,
            progress: progress_hook,
        };

        // SAFETY: the wrapper's entry catches panics and only uses the
        // hook table while this frame is alive.
        let code = unsafe { entry(&hooks) };
        EntryStatus::from(code)
    };

    match status {
        EntryStatus::Success => {
            tracing::debug!("Script {} finished cleanly", script_name);
        }
        EntryStatus::RuntimeError | EntryStatus::Panic => {
            // Details already went through the error hook.
            tracing::debug!("Script {} reported {:?}", script_name, status);
        }
    }

    lock(libraries).push(library);
}

unsafe extern "C" fn dump_hook(context: *mut c_void, ptr: *const u8, len: usize) {
    let ctx = unsafe { &*(context as *const HookContext) };
    let text = unsafe { text_from_raw(ptr, len) };
    ctx.events.send(RunnerEvent::Output { text });
}

unsafe extern "C" fn error_hook(context: *mut c_void, ptr: *const u8, len: usize) {
    let ctx = unsafe { &*(context as *const HookContext) };
    let message = unsafe { text_from_raw(ptr, len) };
    ctx.events.send(RunnerEvent::RuntimeError { message });
}

/// Announce the wait, then block until the host delivers a line.
unsafe extern "C" fn read_line_hook(context: *mut c_void, buf: *mut u8, cap: usize) -> isize {
    let ctx = unsafe { &*(context as *const HookContext) };
    ctx.events.send(RunnerEvent::ReadInput);

    match ctx.input_rx.recv() {
        Ok(line) => {
            let bytes = line.as_bytes();
            let n = bytes.len().min(cap).min(READ_LINE_BUF_CAP);
            // SAFETY: the wrapper owns `buf` with capacity `cap`.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, n) };
            n as isize
        }
        Err(_) => -1, // Runner is shutting down; no input will come
    }
}

unsafe extern "C" fn progress_hook(context: *mut c_void, percent: f64) {
    let ctx = unsafe { &*(context as *const HookContext) };
    ctx.events.send(RunnerEvent::Progress { percent });
}

/// Copy a hook string payload out of the script's memory.
unsafe fn text_from_raw(ptr: *const u8, len: usize) -> String {
    if ptr.is_null() || len == 0 {
        return String::new();
    }
    // SAFETY: the wrapper passes a live (ptr, len) pair for the call.
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    String::from_utf8_lossy(slice).into_owned()
}
