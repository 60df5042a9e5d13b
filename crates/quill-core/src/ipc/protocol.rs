//! Wire protocol between the host and its runner processes.
//!
//! Messages travel over the runner's stdin/stdout as rkyv frames: a
//! 4-byte little-endian length followed by the archived body.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on one frame body. Lengths past this indicate a corrupt
/// or desynchronized stream, not a legitimate message.
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Command sent from the host to a runner process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum RunnerCommand {
    /// Load a compiled script and execute its entry point.
    Run {
        /// Path to the compiled dylib.
        artifact_path: String,
        /// Exported symbol to call.
        entry_symbol: String,
        /// Script name for error reporting.
        script_name: String,
        /// Directory the script executes in. Runners are reused across
        /// scripts, so this travels with every run.
        working_dir: String,
    },

    /// Deliver one line of user input to a waiting script.
    Input {
        /// Input text without trailing newline.
        text: String,
    },

    /// Shutdown the runner process gracefully.
    Shutdown,

    /// Ping to check if the runner is alive.
    Ping,
}

/// Event sent from a runner process back to the host.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum RunnerEvent {
    /// Script produced output text.
    Output {
        /// Captured text, possibly a partial line.
        text: String,
    },

    /// Script is blocked waiting for one line of input.
    ReadInput,

    /// Script reported progress.
    Progress {
        /// Completion percentage in `0.0..=100.0`.
        percent: f64,
    },

    /// Script hit a runtime error or panic. The run continues to its
    /// normal end; this is diagnostic output, not a terminal state.
    RuntimeError {
        /// Error or panic message.
        message: String,
    },

    /// Entry point returned; the run is over.
    Finished,

    /// Response to a Ping command.
    Pong,

    /// Acknowledgement of a shutdown request.
    ShuttingDown,
}

/// Encode `message` and write it as one frame.
///
/// Header and body go out in a single `write_all` so a frame is never
/// half-visible to the peer, then the writer is flushed.
pub fn write_frame<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let body = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode runner frame: {e}")))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    writer
        .write_all(&frame)
        .and_then(|()| writer.flush())
        .map_err(|e| Error::Ipc(format!("Failed to write runner frame: {e}")))
}

/// Read one frame and decode it as `T`.
///
/// Deserialization is unchecked: both ends of the channel are this
/// crate's own processes encoding with the same rkyv schema, so the
/// bytes are trusted.
pub fn read_frame<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::Ipc(format!("Failed to read frame header: {e}")))?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("Frame of {len} bytes exceeds limit")));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Ipc(format!("Failed to read frame body: {e}")))?;

    // SAFETY: frames come only from the paired host/runner process built
    // from this same crate; the archived bytes match `T`'s schema.
    unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&body) }
        .map_err(|e| Error::Serialization(format!("Failed to decode runner frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_header_carries_body_length() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &RunnerCommand::Ping).unwrap();

        let header: [u8; 4] = buf[..4].try_into().unwrap();
        assert_eq!(u32::from_le_bytes(header) as usize, buf.len() - 4);
    }

    #[test]
    fn test_run_command_survives_the_channel() {
        let cmd = RunnerCommand::Run {
            artifact_path: "/tmp/libscript_1_debug.so".to_string(),
            entry_symbol: "quill_entry_1".to_string(),
            script_name: "script-1".to_string(),
            working_dir: "/tmp/scratch".to_string(),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &cmd).unwrap();
        let decoded: RunnerCommand = read_frame(&mut Cursor::new(buf)).unwrap();

        match decoded {
            RunnerCommand::Run {
                artifact_path,
                entry_symbol,
                script_name,
                working_dir,
            } => {
                assert_eq!(artifact_path, "/tmp/libscript_1_debug.so");
                assert_eq!(entry_symbol, "quill_entry_1");
                assert_eq!(script_name, "script-1");
                assert_eq!(working_dir, "/tmp/scratch");
            }
            other => panic!("Decoded the wrong command: {other:?}"),
        }
    }

    #[test]
    fn test_consecutive_frames_stay_separated() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &RunnerEvent::Output { text: "a".into() }).unwrap();
        write_frame(&mut buf, &RunnerEvent::Finished).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: RunnerEvent = read_frame(&mut cursor).unwrap();
        let second: RunnerEvent = read_frame(&mut cursor).unwrap();

        assert!(matches!(first, RunnerEvent::Output { text } if text == "a"));
        assert!(matches!(second, RunnerEvent::Finished));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(200u32 * 1024 * 1024).to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let result: Result<RunnerEvent> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
