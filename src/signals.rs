//! Signal state (C3): per-thread pending/blocked sets, per-process
//! dispositions, sigaltstack, and the siginfo non-coalescing invariant.
//!
//! Grounded in the shim shared-memory layout sketched in SPEC_FULL.md §6
//! (`sigaction[64]`, per-thread blocked/pending words, per-thread siginfo
//! array, per-thread sigaltstack) — modeled here as plain Rust state since
//! the actual shared-memory wire format is an embedder concern.

use crate::errno::GuestErrno;
use bitflags::bitflags;

pub const NSIG: usize = 64;
const SIGKILL: i32 = 9;
const SIGSTOP: i32 = 19;

// The pending/blocked sets are packed one bit per signal into a u64; if
// NSIG ever grows past 64 that packing silently breaks.
static_assertions::const_assert!(NSIG <= 64);

fn is_valid_signum(sig: i32) -> bool {
    sig >= 1 && (sig as usize) <= NSIG
}

fn bit(sig: i32) -> u64 {
    1u64 << ((sig - 1) as u32)
}

/// Signals whose default disposition is "ignore" rather than "terminate"
/// (Linux signal(7)). The core only tracks dispositions; it never itself
/// terminates a process on an unhandled signal.
pub fn default_action_is_ignore(sig: i32) -> bool {
    matches!(sig, 18 | 23 | 28 | 20) // SIGCONT, SIGURG, SIGWINCH, SIGCHLD
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Disposition {
    Default,
    Ignore,
    Handler(u64),
}

bitflags! {
    pub struct SigactionFlags: u32 {
        const SA_RESTART = 0x1000_0000;
        const SA_SIGINFO = 0x0000_0004;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Action {
    pub disposition: Disposition,
    pub flags: SigactionFlags,
    pub mask: u64,
}

impl Default for Action {
    fn default() -> Self {
        Action { disposition: Disposition::Default, flags: SigactionFlags::empty(), mask: 0 }
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_pid: i32,
    pub si_code: i32,
}

bitflags! {
    pub struct SigaltstackFlags: u32 {
        const ONSTACK = 0x1;
        const DISABLE = 0x2;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SigaltstackDescription {
    pub sp: u64,
    pub size: u64,
    pub flags: SigaltstackFlags,
}

impl Default for SigaltstackDescription {
    fn default() -> Self {
        SigaltstackDescription { sp: 0, size: 0, flags: SigaltstackFlags::empty() }
    }
}

/// Process-wide signal dispositions. Owned by `Process` (§3).
#[derive(Debug)]
pub struct ProcessSignalState {
    dispositions: [Action; NSIG],
}

impl ProcessSignalState {
    pub fn new() -> ProcessSignalState {
        ProcessSignalState { dispositions: [Action::default(); NSIG] }
    }

    pub fn get_action(&self, sig: i32) -> Result<Action, GuestErrno> {
        if !is_valid_signum(sig) {
            return Err(GuestErrno::EINVAL);
        }
        Ok(self.dispositions[(sig - 1) as usize])
    }

    pub fn set_action(&mut self, sig: i32, action: Action) -> Result<(), GuestErrno> {
        if !is_valid_signum(sig) || sig == SIGKILL || sig == SIGSTOP {
            return Err(GuestErrno::EINVAL);
        }
        self.dispositions[(sig - 1) as usize] = action;
        Ok(())
    }

    fn effectively_ignored(&self, sig: i32) -> bool {
        match self.dispositions[(sig - 1) as usize].disposition {
            Disposition::Ignore => true,
            Disposition::Default => default_action_is_ignore(sig),
            Disposition::Handler(_) => false,
        }
    }
}

impl Default for ProcessSignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread signal state: pending/blocked sets, siginfo, sigaltstack. A
/// `ThreadSignalState` needs a `ProcessSignalState` to resolve dispositions
/// but does not own one (§3: dispositions are process-wide).
#[derive(Debug)]
pub struct ThreadSignalState {
    pending: u64,
    blocked: u64,
    siginfo: [SigInfo; NSIG],
    sigaltstack: SigaltstackDescription,
    /// Set by a condition wake; consumed by the next `take_wake_signal`.
    wake_signal: Option<i32>,
}

impl ThreadSignalState {
    pub fn new() -> ThreadSignalState {
        ThreadSignalState {
            pending: 0,
            blocked: 0,
            siginfo: [SigInfo::default(); NSIG],
            sigaltstack: SigaltstackDescription::default(),
            wake_signal: None,
        }
    }

    pub fn blocked(&self) -> u64 {
        self.blocked
    }

    pub fn set_blocked(&mut self, mask: u64) {
        self.blocked = mask;
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn is_pending(&self, sig: i32) -> bool {
        self.pending & bit(sig) != 0
    }

    pub fn has_unblocked_pending(&self) -> bool {
        self.pending & !self.blocked != 0
    }

    pub fn siginfo(&self, sig: i32) -> SigInfo {
        self.siginfo[(sig - 1) as usize]
    }

    pub fn sigaltstack(&self) -> SigaltstackDescription {
        self.sigaltstack
    }

    pub fn set_sigaltstack(
        &mut self,
        new: Option<SigaltstackDescription>,
    ) -> Result<SigaltstackDescription, GuestErrno> {
        let old = self.sigaltstack;
        if let Some(desc) = new {
            if old.flags.contains(SigaltstackFlags::ONSTACK) {
                return Err(GuestErrno::EPERM);
            }
            let known = SigaltstackFlags::ONSTACK | SigaltstackFlags::DISABLE;
            if !known.contains(desc.flags) {
                return Err(GuestErrno::EINVAL);
            }
            if desc.flags.contains(SigaltstackFlags::DISABLE) {
                self.sigaltstack = SigaltstackDescription {
                    sp: 0,
                    size: 0,
                    flags: SigaltstackFlags::DISABLE,
                };
            } else {
                self.sigaltstack = desc;
            }
        }
        Ok(old)
    }

    /// Deliver `sig` to this thread. Validates range; drops silently if
    /// effectively ignored; otherwise sets pending and writes siginfo only
    /// if the signal was not already pending (non-coalescing invariant,
    /// §3/§8). Returns whether the signal became newly pending (the caller
    /// uses this to decide whether to wake a blocked condition).
    pub fn send(
        &mut self,
        sig: i32,
        info: SigInfo,
        process: &ProcessSignalState,
    ) -> Result<bool, GuestErrno> {
        if !is_valid_signum(sig) {
            return Err(GuestErrno::EINVAL);
        }
        if process.effectively_ignored(sig) {
            return Ok(false);
        }
        let already_pending = self.is_pending(sig);
        self.pending |= bit(sig);
        if !already_pending {
            self.siginfo[(sig - 1) as usize] = info;
        }
        Ok(!already_pending)
    }

    /// Called by C4 when a condition with this thread's signal-wake mask
    /// fires for a signal reason.
    pub fn note_wake_signal(&mut self, sig: i32) {
        self.wake_signal = Some(sig);
    }

    pub fn take_wake_signal(&mut self) -> Option<i32> {
        self.wake_signal.take()
    }
}

impl Default for ThreadSignalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_action_rejects_sigkill_and_sigstop() {
        let mut proc_state = ProcessSignalState::new();
        assert_eq!(proc_state.set_action(SIGKILL, Action::default()), Err(GuestErrno::EINVAL));
        assert_eq!(proc_state.set_action(SIGSTOP, Action::default()), Err(GuestErrno::EINVAL));
    }

    #[test]
    fn action_round_trips() {
        let mut proc_state = ProcessSignalState::new();
        let action = Action {
            disposition: Disposition::Handler(0x4000),
            flags: SigactionFlags::SA_RESTART,
            mask: 0xff,
        };
        proc_state.set_action(10, action).unwrap();
        let back = proc_state.get_action(10).unwrap();
        assert_eq!(back.mask, 0xff);
        assert!(back.flags.contains(SigactionFlags::SA_RESTART));
    }

    #[test]
    fn second_send_while_pending_does_not_overwrite_siginfo() {
        let proc_state = ProcessSignalState::new();
        let mut thread = ThreadSignalState::new();
        thread
            .send(10, SigInfo { si_signo: 10, si_pid: 100, si_code: 0 }, &proc_state)
            .unwrap();
        let became_pending =
            thread.send(10, SigInfo { si_signo: 10, si_pid: 200, si_code: 0 }, &proc_state).unwrap();
        assert!(!became_pending);
        assert_eq!(thread.siginfo(10).si_pid, 100);
    }

    #[test]
    fn send_dropped_silently_when_ignored() {
        let mut proc_state = ProcessSignalState::new();
        proc_state
            .set_action(10, Action { disposition: Disposition::Ignore, ..Action::default() })
            .unwrap();
        let mut thread = ThreadSignalState::new();
        let became_pending =
            thread.send(10, SigInfo::default(), &proc_state).unwrap();
        assert!(!became_pending);
        assert!(!thread.is_pending(10));
    }

    #[test]
    fn sigaltstack_rejects_modification_while_onstack() {
        let mut thread = ThreadSignalState::new();
        thread
            .set_sigaltstack(Some(SigaltstackDescription {
                sp: 0x1000,
                size: 4096,
                flags: SigaltstackFlags::ONSTACK,
            }))
            .unwrap();
        let result = thread.set_sigaltstack(Some(SigaltstackDescription {
            sp: 0x2000,
            size: 4096,
            flags: SigaltstackFlags::empty(),
        }));
        assert_eq!(result, Err(GuestErrno::EPERM));
    }

    #[test]
    fn sigaltstack_unknown_flag_is_invalid() {
        let mut thread = ThreadSignalState::new();
        // Safety: constructing a deliberately out-of-range flags value to
        // exercise the `known.contains(desc.flags)` rejection; `from_bits`
        // is what real callers get this rejection from, this just needs a
        // value that would fail it.
        let bogus = unsafe { SigaltstackFlags::from_bits_unchecked(0x8000) };
        let result = thread.set_sigaltstack(Some(SigaltstackDescription {
            sp: 0,
            size: 0,
            flags: bogus,
        }));
        assert_eq!(result, Err(GuestErrno::EINVAL));
    }

    #[test]
    fn unblocked_pending_detection() {
        let mut thread = ThreadSignalState::new();
        thread.set_blocked(bit(5));
        let proc_state = ProcessSignalState::new();
        thread.send(5, SigInfo::default(), &proc_state).unwrap();
        assert!(!thread.has_unblocked_pending());
        thread.send(6, SigInfo::default(), &proc_state).unwrap();
        assert!(thread.has_unblocked_pending());
    }
}
