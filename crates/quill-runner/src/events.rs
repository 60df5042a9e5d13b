//! Shared event stream back to the host.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use quill_core::ipc::{RunnerEvent, write_frame};

/// Lock a mutex, recovering the guard if a writer panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serialized writer for runner events.
///
/// Shared between the command loop, the run thread's hooks, and the
/// output capture thread; the mutex keeps messages whole on the wire.
#[derive(Clone)]
pub struct EventWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl EventWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Send one event. Write failures mean the host is gone; they are
    /// logged and otherwise ignored.
    pub fn send(&self, event: RunnerEvent) {
        let mut writer = lock(&self.inner);
        if let Err(e) = write_frame(&mut *writer, &event) {
            tracing::debug!("Failed to write event: {}", e);
        }
    }
}
