//! Stdio isolation for the runner process.
//!
//! Both standard streams carry IPC: stdin brings commands, stdout takes
//! events. A script that reads or prints directly would corrupt the
//! framing, so before any script loads the original descriptors are
//! duplicated for IPC use and the well-known numbers are rewired:
//! fd 0 becomes /dev/null (direct reads see EOF), fd 1 becomes a pipe
//! whose contents are forwarded as `Output` events.

use std::fs::File;
use std::io::{Read, Write};
use std::thread::JoinHandle;

use quill_core::ipc::RunnerEvent;

use crate::events::EventWriter;

/// The process's streams after rewiring.
pub struct RedirectedStdio {
    /// Command stream from the host (the original stdin).
    pub commands: Box<dyn Read + Send>,
    /// Event stream to the host (the original stdout).
    pub events: Box<dyn Write + Send>,
    /// Read end of the output capture pipe, when capture is active.
    pub captured: Option<File>,
}

/// Rewire the standard descriptors for script isolation.
#[cfg(unix)]
pub fn redirect() -> anyhow::Result<RedirectedStdio> {
    use std::os::fd::FromRawFd;

    // SAFETY: every fd passed to from_raw_fd below is freshly created by
    // dup/pipe and owned by exactly one File.
    unsafe {
        let commands_fd = libc::dup(0);
        if commands_fd < 0 {
            anyhow::bail!("failed to duplicate stdin: {}", last_os_error());
        }

        let events_fd = libc::dup(1);
        if events_fd < 0 {
            anyhow::bail!("failed to duplicate stdout: {}", last_os_error());
        }

        // Scripts reading stdin directly see EOF instead of eating IPC
        // commands.
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY);
        if devnull >= 0 {
            if libc::dup2(devnull, 0) < 0 {
                tracing::warn!("failed to redirect stdin: {}", last_os_error());
            }
            libc::close(devnull);
        } else {
            tracing::warn!("failed to open /dev/null: {}", last_os_error());
        }

        // Everything written to fd 1 (println!, native code) lands in the
        // capture pipe.
        let mut fds = [0i32; 2];
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            anyhow::bail!("failed to create capture pipe: {}", last_os_error());
        }
        let (pipe_r, pipe_w) = (fds[0], fds[1]);
        if libc::dup2(pipe_w, 1) < 0 {
            anyhow::bail!("failed to redirect stdout: {}", last_os_error());
        }
        libc::close(pipe_w);

        Ok(RedirectedStdio {
            commands: Box::new(File::from_raw_fd(commands_fd)),
            events: Box::new(File::from_raw_fd(events_fd)),
            captured: Some(File::from_raw_fd(pipe_r)),
        })
    }
}

/// Without fd rewiring, scripts must go through the host hooks; direct
/// console writes are not captured.
#[cfg(not(unix))]
pub fn redirect() -> anyhow::Result<RedirectedStdio> {
    Ok(RedirectedStdio {
        commands: Box::new(std::io::stdin()),
        events: Box::new(std::io::stdout()),
        captured: None,
    })
}

#[cfg(unix)]
fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Forward captured console bytes to the host as `Output` events.
pub fn spawn_forwarder(mut captured: File, events: EventWriter) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match captured.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    events.send(RunnerEvent::Output { text });
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("Capture pipe closed: {}", e);
                    break;
                }
            }
        }
    })
}
