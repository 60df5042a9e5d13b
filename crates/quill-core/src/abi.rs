//! C ABI shared between generated script wrappers and the runner.
//!
//! The generated wrapper crate cannot depend on quill-core (it links only
//! the restored dependencies and std), so the wrapper re-declares these
//! types structurally. The layouts here are the canonical ones the runner
//! builds against; `compile::wrapper` emits matching declarations and a
//! test pins the two together.

use std::ffi::c_void;

/// Result code returned by a script's entry function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EntryStatus {
    Success = 0,
    RuntimeError = -2,
    Panic = -4,
}

impl From<i32> for EntryStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -4 => Self::Panic,
            _ => Self::RuntimeError,
        }
    }
}

/// Host callbacks handed to the script entry function.
///
/// All pointers are valid for the duration of the entry call only. String
/// payloads are UTF-8, not NUL-terminated; length travels alongside.
#[repr(C)]
pub struct HostHooks {
    /// Opaque runner-side context, passed back through every hook.
    pub context: *mut c_void,
    /// Report a dumped value or console text.
    pub dump: unsafe extern "C" fn(context: *mut c_void, ptr: *const u8, len: usize),
    /// Report a runtime error message (panic text, caught failure).
    pub error: unsafe extern "C" fn(context: *mut c_void, ptr: *const u8, len: usize),
    /// Block for one line of interactive input. Writes up to `cap` bytes
    /// into `buf` and returns the length, or -1 when no input is available.
    pub read_line: unsafe extern "C" fn(context: *mut c_void, buf: *mut u8, cap: usize) -> isize,
    /// Report execution progress in percent (0.0 to 100.0).
    pub progress: unsafe extern "C" fn(context: *mut c_void, percent: f64),
}

/// Entry function exported by a compiled script artifact.
pub type ScriptEntryFn = unsafe extern "C" fn(hooks: *const HostHooks) -> i32;

/// Maximum bytes `read_line` will write into the caller's buffer.
pub const READ_LINE_BUF_CAP: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_status_from_code() {
        assert_eq!(EntryStatus::from(0), EntryStatus::Success);
        assert_eq!(EntryStatus::from(-4), EntryStatus::Panic);
        assert_eq!(EntryStatus::from(-2), EntryStatus::RuntimeError);
        assert_eq!(EntryStatus::from(99), EntryStatus::RuntimeError);
    }
}
