//! Three-column dispatch classification (§4.6): is this syscall number
//! handled by a simulated handler, passed straight to the guest's OS, or
//! unsupported (`ENOSYS`, logged once)? Kept as a pure function so "what
//! class is this" is checkable independently of "what does the handler do".

use super::numbers::*;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallClass {
    Handled,
    Native,
    Unsupported,
}

pub fn class_of(syscall_number: i64) -> SyscallClass {
    if is_shadow_syscall(syscall_number) {
        return SyscallClass::Handled;
    }
    match syscall_number {
        READ | WRITE | NANOSLEEP | CLOCK_GETTIME | GETTIMEOFDAY | TIME | KILL | TGKILL | TKILL
        | RT_SIGACTION | RT_SIGPROCMASK | SIGALTSTACK | CLONE | FUTEX | UNAME | GETPID
        | SET_TID_ADDRESS | SELECT_OLD | PSELECT6 | POLL | PPOLL | SYSINFO | SOCKET
        | EPOLL_CREATE1 | EPOLL_CTL | EPOLL_WAIT | MMAP | MREMAP | MUNMAP => SyscallClass::Handled,

        ARCH_PRCTL | RT_SIGRETURN | MPROTECT | CLOSE => SyscallClass::Native,

        SIGACTION_OBSOLETE | SIGNAL_OBSOLETE | SIGPROCMASK_OBSOLETE | SENDFILE | SPLICE | TEE
        | RECVMMSG | SENDMMSG => SyscallClass::Unsupported,

        _ => SyscallClass::Native,
    }
}

/// Debug-only cross-check, gated behind a feature so it never runs in a
/// release build: every number this module names explicitly must resolve
/// to exactly one class, since the `match` above would otherwise silently
/// let a later arm shadow an earlier one.
#[cfg(feature = "verify_syscall_numbers")]
pub fn verify_no_duplicate_classification() {
    let named = [
        READ, WRITE, NANOSLEEP, CLOCK_GETTIME, GETTIMEOFDAY, TIME, KILL, TGKILL, TKILL,
        RT_SIGACTION, RT_SIGPROCMASK, SIGALTSTACK, CLONE, FUTEX, UNAME, GETPID, SET_TID_ADDRESS,
        SELECT_OLD, PSELECT6, POLL, PPOLL, SYSINFO, SOCKET, EPOLL_CREATE1, EPOLL_CTL, EPOLL_WAIT,
        MMAP, MREMAP, MUNMAP, ARCH_PRCTL, RT_SIGRETURN, MPROTECT, CLOSE, SIGACTION_OBSOLETE,
        SIGNAL_OBSOLETE, SIGPROCMASK_OBSOLETE, SENDFILE, SPLICE, TEE, RECVMMSG, SENDMMSG,
    ];
    let mut seen = std::collections::HashSet::new();
    for n in named {
        assert!(seen.insert(n), "syscall number {} named more than once in class_of", n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_range_is_always_handled() {
        assert_eq!(class_of(1000), SyscallClass::Handled);
        assert_eq!(class_of(1005), SyscallClass::Handled);
    }

    #[cfg(feature = "verify_syscall_numbers")]
    #[test]
    fn no_duplicate_classification() {
        verify_no_duplicate_classification();
    }

    #[test]
    fn obsolete_signal_calls_are_unsupported() {
        assert_eq!(class_of(SIGACTION_OBSOLETE), SyscallClass::Unsupported);
        assert_eq!(class_of(SENDMMSG), SyscallClass::Unsupported);
    }

    #[test]
    fn arch_prctl_is_native() {
        assert_eq!(class_of(ARCH_PRCTL), SyscallClass::Native);
    }

    #[test]
    fn nanosleep_is_handled() {
        assert_eq!(class_of(NANOSLEEP), SyscallClass::Handled);
    }
}
