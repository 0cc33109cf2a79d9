//! Guest-observable errno taxonomy and internal (non-guest-visible) error type.
//!
//! Two hierarchies, deliberately never conflated (SPEC_FULL.md §7):
//! `GuestErrno` values are always surfaced to the guest as `Done(-errno)`.
//! `CoreError` covers failures in talking to the OS/tracing layer that are
//! recoverable enough to report rather than abort on.

use std::fmt;

/// Guest-observable errno values this core ever returns. Grounded in the
/// taxonomy of SPEC_FULL.md §7; deliberately not a 1:1 wrapper of every
/// libc errno, only the ones this core's handlers actually produce.
#[repr(i64)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GuestErrno {
    EPERM = 1,
    ESRCH = 3,
    EINTR = 4,
    EBADF = 9,
    EWOULDBLOCK = 11,
    EFAULT = 14,
    ESPIPE = 29,
    EINVAL = 22,
    ENOSYS = 38,
    ENAMETOOLONG = 36,
    ENOTSUP = 95,
    ECHILD = 10,
}

impl GuestErrno {
    /// The value a syscall handler hands back inside `SyscallReturn::Done`.
    pub fn as_neg_i64(self) -> i64 {
        -(self as i64)
    }
}

impl fmt::Display for GuestErrno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Internal errors from the tracing/memory layer. Never returned to the
/// guest directly; callers at the C6/C8 boundary translate these into
/// either a `GuestErrno` (when one applies) or a `panic!` (core invariant
/// violation, per SPEC_FULL.md §7).
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("ptrace request failed: {0}")]
    Ptrace(#[from] nix::Error),

    #[error("/proc/{pid}/mem access failed: {source}")]
    ProcMem {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("short read/write against tracee memory: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("tracee vanished before syscall injection completed")]
    ChildVanished,

    #[error("guest process failed to reach its launch synchronization stop: {0}")]
    LaunchFailed(String),
}

impl CoreError {
    /// Maps a core error to the errno a guest-initiated read should see.
    /// Per §7: reads initiated by a guest pointer become `EFAULT`; this is
    /// never used for the write path, which aborts instead.
    pub fn as_guest_read_errno(&self) -> GuestErrno {
        GuestErrno::EFAULT
    }
}
