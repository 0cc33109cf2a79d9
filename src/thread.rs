//! Managed Thread (C5): fork/exec, ptrace attach/detach, single-step,
//! register snapshot refresh, native-syscall injection, and the hybrid
//! wait that races a ptrace-stop against an IPC shim event.
//!
//! Grounded in examples/isgasho-rd/src/registers.rs's ptrace usage style
//! and examples/other_examples/af97fa61_shadow-shadow__...managed_thread.rs
//! for the resume/event-loop shape (`ResumeResult`, the IPC-vs-ptrace race),
//! rewritten against the teacher's actual dependency (`nix::sys::ptrace`)
//! rather than the private crates that file imports.

use crate::condition::SyscallCondition;
use crate::errno::CoreError;
use crate::registers::Registers;
use crate::signals::ThreadSignalState;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::CString;

/// Lifecycle states from the data model (§3): `NONE -> TRACE_ME ->
/// (SYSCALL|IPC_SYSCALL|SIGNALLED|EXECVE)* -> EXITED`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    None,
    TraceMe,
    Syscall,
    IpcSyscall,
    Signalled,
    Execve,
    Exited,
}

/// Which of the two hybrid-wait sources produced a stop.
#[derive(Debug)]
pub enum StopEvent {
    Ptrace(WaitStatus),
    Ipc,
}

/// Abstraction over the tracing channel so a future IPC-only backend can
/// be added without touching C6/C8 (SPEC_FULL.md §4.5 Open Question
/// resolution: explicit buffered-stop state, backend kept swappable).
pub trait TracingBackend {
    /// Fork, drop PDEATHSIG-on-parent-death, disable TSC reads, self-trace,
    /// and `execvpe` the guest (§4.5 "Launching"). Returns the native pid
    /// of the new child; the child side never returns to its caller.
    fn fork_exec(&mut self, argv: &[CString], envp: &[CString]) -> Result<Pid, CoreError>;
    /// Block until the child's synchronizing `raise(SIGSTOP)` is observed.
    fn wait_for_initial_stop(&mut self, pid: Pid) -> Result<(), CoreError>;
    /// Set the trace options this crate relies on once a child is being
    /// traced: `EXITKILL | TRACESYSGOOD | TRACEEXEC`.
    fn setoptions(&mut self, pid: Pid) -> Result<(), CoreError>;
    fn attach(&mut self, pid: Pid) -> Result<(), CoreError>;
    fn detach(&mut self, pid: Pid) -> Result<(), CoreError>;
    fn cont_syscall(&mut self, pid: Pid) -> Result<(), CoreError>;
    fn sysemu(&mut self, pid: Pid) -> Result<(), CoreError>;
    fn singlestep(&mut self, pid: Pid) -> Result<(), CoreError>;
    fn get_regs(&mut self, pid: Pid) -> Result<libc::user_regs_struct, CoreError>;
    fn set_regs(&mut self, pid: Pid, regs: &libc::user_regs_struct) -> Result<(), CoreError>;
    /// Non-blocking poll for a ptrace-stop. `None` means "nothing yet".
    fn try_wait(&mut self, pid: Pid) -> Result<Option<WaitStatus>, CoreError>;
    /// Non-blocking poll for a shim IPC event. `None` means "nothing yet".
    fn try_ipc_poll(&mut self) -> Option<()>;
}

/// Real ptrace-backed implementation. The IPC side is a stub here
/// (`try_ipc_poll` always returns `None`) since the shared-memory shim
/// protocol itself is an embedder/guest-side concern (§6); this crate only
/// needs to race it fairly, which `ManagedThread::hybrid_wait` does
/// regardless of whether IPC ever fires.
pub struct PtraceBackend;

impl TracingBackend for PtraceBackend {
    fn fork_exec(&mut self, argv: &[CString], envp: &[CString]) -> Result<Pid, CoreError> {
        match unistd::fork().map_err(CoreError::from)? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => {
                // Guards against the race where the real parent has already
                // exited by the time PDEATHSIG is armed.
                let parent_at_fork = unistd::getppid();
                unsafe {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
                }
                if unistd::getppid() != parent_at_fork {
                    std::process::exit(1);
                }
                unsafe {
                    libc::prctl(libc::PR_SET_TSC, libc::PR_TSC_SIGSEGV as libc::c_ulong);
                }
                if ptrace::traceme().is_err() {
                    std::process::exit(1);
                }
                if signal::raise(Signal::SIGSTOP).is_err() {
                    std::process::exit(1);
                }
                let _ = unistd::execvpe(&argv[0], argv, envp);
                // execvpe only returns on failure.
                std::process::exit(127);
            }
        }
    }

    fn wait_for_initial_stop(&mut self, pid: Pid) -> Result<(), CoreError> {
        match wait::waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => Ok(()),
            Ok(other) => Err(CoreError::LaunchFailed(format!("{:?}", other))),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    fn setoptions(&mut self, pid: Pid) -> Result<(), CoreError> {
        let opts = ptrace::Options::PTRACE_O_EXITKILL
            | ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEEXEC;
        ptrace::setoptions(pid, opts).map_err(CoreError::from)
    }

    fn attach(&mut self, pid: Pid) -> Result<(), CoreError> {
        ptrace::attach(pid).map_err(CoreError::from)
    }

    fn detach(&mut self, pid: Pid) -> Result<(), CoreError> {
        ptrace::detach(pid, None).map_err(CoreError::from)
    }

    fn cont_syscall(&mut self, pid: Pid) -> Result<(), CoreError> {
        ptrace::syscall(pid, None).map_err(CoreError::from)
    }

    fn sysemu(&mut self, pid: Pid) -> Result<(), CoreError> {
        // SAFETY: PTRACE_SYSEMU, request 31, not wrapped by `nix` directly.
        let ret = unsafe {
            libc::ptrace(31 /* PTRACE_SYSEMU */, pid.as_raw(), std::ptr::null_mut::<libc::c_void>(), 0)
        };
        if ret == -1 {
            return Err(CoreError::from(nix::Error::Sys(nix::errno::Errno::last())));
        }
        Ok(())
    }

    fn singlestep(&mut self, pid: Pid) -> Result<(), CoreError> {
        ptrace::step(pid, None).map_err(CoreError::from)
    }

    fn get_regs(&mut self, pid: Pid) -> Result<libc::user_regs_struct, CoreError> {
        ptrace::getregs(pid).map_err(CoreError::from)
    }

    fn set_regs(&mut self, pid: Pid, regs: &libc::user_regs_struct) -> Result<(), CoreError> {
        ptrace::setregs(pid, *regs).map_err(CoreError::from)
    }

    fn try_wait(&mut self, pid: Pid) -> Result<Option<WaitStatus>, CoreError> {
        match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(status)),
            Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => Ok(None),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    fn try_ipc_poll(&mut self) -> Option<()> {
        None
    }
}

/// One native OS thread hosting a guest thread (§3). The Process that owns
/// this Thread holds it by value/index; the back-reference to Process is
/// deliberately not stored here (§9: explicit context, not a raw pointer).
pub struct ManagedThread<B: TracingBackend> {
    backend: B,
    pub native_tid: Pid,
    pub native_pid: Pid,
    state: ThreadState,
    pub registers: Registers,
    /// Cached address of a known syscall instruction in the guest's text,
    /// used for native-syscall injection (§4.5).
    pub syscall_insn_addr: Option<u64>,
    pub condition: Option<SyscallCondition>,
    /// TID-clear address for `clone(CHILD_CLEARTID)` (§4.5).
    pub tid_clear_addr: Option<u64>,
    /// A ptrace-stop observed while the IPC side won the hybrid-wait race
    /// in the same iteration; returned on the *next* call instead of being
    /// dropped (§4.5 fairness rule).
    buffered_stop: Option<WaitStatus>,
    /// Syscall number the thread was blocked on, for the C6 invariant that
    /// a resumed blocked syscall must re-enter with the same number.
    pub blocked_syscall_no: Option<i64>,
    /// Per-thread signal state (C3): pending/blocked sets, siginfo,
    /// sigaltstack. Dispositions themselves live on the owning Process.
    pub signals: ThreadSignalState,
    /// A syscall result computed by the unblocked-CPU-latency model
    /// (§4.6) but deferred behind a synthetic timeout Condition. Returned
    /// directly on the next `make_syscall` without re-running the handler.
    pub pending_result: Option<i64>,
}

impl<B: TracingBackend> ManagedThread<B> {
    pub fn new(backend: B, native_pid: Pid, native_tid: Pid) -> ManagedThread<B> {
        ManagedThread {
            backend,
            native_tid,
            native_pid,
            state: ThreadState::None,
            registers: Registers::new(),
            syscall_insn_addr: None,
            condition: None,
            tid_clear_addr: None,
            buffered_stop: None,
            blocked_syscall_no: None,
            signals: ThreadSignalState::new(),
            pending_result: None,
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Fork, self-trace, and exec a fresh guest process (§4.5 "Launching"):
    /// fork, drop PDEATHSIG, disable TSC reads, `PTRACE_TRACEME`,
    /// `raise(SIGSTOP)`, `execvpe`; then, on the parent side, wait for the
    /// synchronizing stop and set `EXITKILL | TRACESYSGOOD | TRACEEXEC`.
    pub fn launch(mut backend: B, argv: &[CString], envp: &[CString]) -> Result<ManagedThread<B>, CoreError> {
        let native_pid = backend.fork_exec(argv, envp)?;
        backend.wait_for_initial_stop(native_pid)?;
        backend.setoptions(native_pid)?;
        let mut thread = ManagedThread::new(backend, native_pid, native_pid);
        thread.state = ThreadState::Syscall;
        Ok(thread)
    }

    /// Attach to an already-running, untraced process via `PTRACE_ATTACH`
    /// — as opposed to `launch`, which starts a fresh child through
    /// `PTRACE_TRACEME` and never needs a separate attach step.
    pub fn complete_attach(&mut self) -> Result<(), CoreError> {
        self.backend.attach(self.native_tid)?;
        self.state = ThreadState::Syscall;
        Ok(())
    }

    /// Race a non-blocking ptrace poll against an IPC shim poll, returning
    /// whichever source fires first. If IPC fires first but a ptrace-stop
    /// is *also* observed in the same iteration, the ptrace-stop is
    /// buffered rather than lost (§4.5).
    pub fn hybrid_wait(&mut self) -> Result<Option<StopEvent>, CoreError> {
        if let Some(status) = self.buffered_stop.take() {
            return Ok(Some(StopEvent::Ptrace(status)));
        }
        if self.backend.try_ipc_poll().is_some() {
            if let Some(status) = self.backend.try_wait(self.native_tid)? {
                self.buffered_stop = Some(status);
            }
            return Ok(Some(StopEvent::Ipc));
        }
        if let Some(status) = self.backend.try_wait(self.native_tid)? {
            return Ok(Some(StopEvent::Ptrace(status)));
        }
        Ok(None)
    }

    /// Refresh the cached register snapshot from the CPU. Called on every
    /// syscall stop before the dispatcher reads `orig_rax`/args.
    pub fn refresh_registers(&mut self) -> Result<(), CoreError> {
        let raw = self.backend.get_regs(self.native_tid)?;
        self.registers.refresh(raw);
        Ok(())
    }

    fn flush_registers_if_dirty(&mut self) -> Result<(), CoreError> {
        if self.registers.dirty() {
            self.backend.set_regs(self.native_tid, self.registers.raw())?;
            self.registers.mark_flushed();
        }
        Ok(())
    }

    /// Apply a `Done(v)` dispatch result: write `rax`, flush, and resume
    /// with `PTRACE_SYSEMU` so the guest's own syscall is skipped (§4.5).
    pub fn resume_with_done(&mut self, value: i64) -> Result<(), CoreError> {
        self.registers.set_rax(value as u64);
        self.flush_registers_if_dirty()?;
        self.backend.sysemu(self.native_tid)?;
        self.state = ThreadState::Syscall;
        Ok(())
    }

    /// Apply a `Native` dispatch result: flush any dirty registers
    /// unrelated to the syscall itself, let the real syscall execute, then
    /// single-step past it so the result can be observed (§4.5).
    pub fn resume_native(&mut self) -> Result<(), CoreError> {
        self.flush_registers_if_dirty()?;
        self.backend.sysemu(self.native_tid)?;
        self.backend.singlestep(self.native_tid)?;
        self.refresh_registers()?;
        self.state = ThreadState::Syscall;
        Ok(())
    }

    /// Record that the thread is now blocked on `condition`, remembering
    /// the syscall number so the next entry can be checked against it
    /// (§4.6 core invariant).
    pub fn block_on(&mut self, condition: SyscallCondition, syscall_no: i64) {
        self.condition = Some(condition);
        self.blocked_syscall_no = Some(syscall_no);
    }

    pub fn clear_block(&mut self) {
        self.condition = None;
        self.blocked_syscall_no = None;
    }

    /// Inject a native syscall directly: point `rip` at the cached syscall
    /// instruction, load `number`/`args`, single-step past it, read `rax`,
    /// then restore the pre-call register state — unless the injected call
    /// was `execve`/`exit`, in which case no restore happens and the state
    /// machine transitions instead (§4.5).
    pub fn inject_syscall(
        &mut self,
        number: i64,
        args: [i64; 6],
        is_execve_or_exit: bool,
    ) -> Result<i64, CoreError> {
        let insn_addr = self
            .syscall_insn_addr
            .expect("native-syscall injection requires a cached syscall instruction address");
        let saved = *self.registers.raw();

        let mut injected = saved;
        injected.rip = insn_addr;
        injected.orig_rax = number as u64;
        injected.rax = number as u64;
        injected.rdi = args[0] as u64;
        injected.rsi = args[1] as u64;
        injected.rdx = args[2] as u64;
        injected.r10 = args[3] as u64;
        injected.r8 = args[4] as u64;
        injected.r9 = args[5] as u64;
        self.backend.set_regs(self.native_tid, &injected)?;

        self.backend.singlestep(self.native_tid)?;
        match self.backend.try_wait(self.native_tid)? {
            Some(WaitStatus::Exited(_, _)) | None => return Err(CoreError::ChildVanished),
            _ => {}
        }

        let after = self.backend.get_regs(self.native_tid)?;
        let result = after.rax as i64;

        if is_execve_or_exit {
            self.state = ThreadState::Execve;
        } else {
            self.backend.set_regs(self.native_tid, &saved)?;
            self.registers.refresh(saved);
        }
        Ok(result)
    }

    /// Detach from a syscall stop only, rewinding `rip` by the
    /// syscall-instruction width (2 bytes for `syscall`) so a future
    /// re-attach observes the same entry (§4.5).
    pub fn detach(&mut self) -> Result<(), CoreError> {
        let mut regs = *self.registers.raw();
        regs.rip -= 2;
        self.backend.set_regs(self.native_tid, &regs)?;
        self.backend.detach(self.native_tid)
    }

    /// Re-attach after a prior `detach`: attach, absorb intermediate
    /// `SIGSTOP`s until a syscall stop is observed, then restore `rip`.
    pub fn reattach(&mut self) -> Result<(), CoreError> {
        self.backend.attach(self.native_tid)?;
        loop {
            match self.backend.try_wait(self.native_tid)? {
                Some(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {
                    self.backend.cont_syscall(self.native_tid)?;
                    continue;
                }
                Some(WaitStatus::PtraceSyscall(_)) | Some(WaitStatus::Stopped(_, _)) => break,
                Some(_) | None => continue,
            }
        }
        self.refresh_registers()
    }

    pub fn mark_exited(&mut self) {
        self.state = ThreadState::Exited;
    }

    /// A `SIGSTOP` stop observed outside a syscall (e.g. from the kernel's
    /// own job-control semantics rather than the tracer's own attach
    /// synchronization) is swallowed or delivered into the guest's signal
    /// state based on `SimulatorConfig::forward_sigstop_to_guest` (§9 Open
    /// Question resolution). Swallowing is the default since most SIGSTOPs
    /// a tracer observes are its own synchronization signals, not ones the
    /// guest sent itself.
    pub fn handle_sigstop_stop(
        &mut self,
        config: &crate::config::SimulatorConfig,
        process_signals: &crate::signals::ProcessSignalState,
    ) {
        if config.forward_sigstop_to_guest {
            let info = crate::signals::SigInfo {
                si_signo: 19,
                si_pid: self.native_pid.as_raw(),
                si_code: 0,
            };
            let _ = self.signals.send(19, info, process_signals);
        }
    }
}

/// Required clone flags; absence of any is `ENOTSUP` (§4.5).
pub const CLONE_VM: u64 = 0x0000_0100;
pub const CLONE_FS: u64 = 0x0000_0200;
pub const CLONE_FILES: u64 = 0x0000_0400;
pub const CLONE_SIGHAND: u64 = 0x0000_0800;
pub const CLONE_THREAD: u64 = 0x0001_0000;
pub const CLONE_SYSVSEM: u64 = 0x0004_0000;
pub const CLONE_PARENT_SETTID: u64 = 0x0010_0000;
pub const CLONE_CHILD_CLEARTID: u64 = 0x0020_0000;
pub const CLONE_CHILD_SETTID: u64 = 0x0100_0000;
pub const CLONE_SETTLS: u64 = 0x0008_0000;

const REQUIRED_CLONE_FLAGS: u64 =
    CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND | CLONE_THREAD | CLONE_SYSVSEM;

const EMULATED_CLONE_FLAGS: u64 = CLONE_PARENT_SETTID | CLONE_CHILD_SETTID | CLONE_CHILD_CLEARTID;

/// Validates the required flag set and returns the flags to pass to the
/// native `clone` (emulated flags stripped, `SETTLS` passed through).
pub fn strip_clone_flags_for_native(flags: u64) -> Result<u64, CoreError> {
    if flags & REQUIRED_CLONE_FLAGS != REQUIRED_CLONE_FLAGS {
        return Err(CoreError::ShortTransfer { expected: 0, actual: 0 });
    }
    Ok(flags & !EMULATED_CLONE_FLAGS)
}
