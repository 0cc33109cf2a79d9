//! Syscall dispatch (C6): number → class → handler, plus the two
//! invariants that live at the dispatch boundary itself (§4.6):
//! a resumed blocked syscall must re-enter with the same number, and the
//! signal-interruption rule is applied after the handler returns, never
//! before.

use crate::memory::MemoryBackend;
use crate::syscall::{class_of, handlers, numbers, DispatchContext, SyscallArgs, SyscallClass, SyscallReturn};
use crate::thread::TracingBackend;

/// Dispatch one syscall stop. Panics if a previously-blocked syscall is
/// being re-entered with a different number — this indicates the outer
/// scheduler resumed the wrong thread or reused a condition incorrectly,
/// which is a core invariant violation (§4.6, §7: abort, fatal).
pub fn dispatch<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    syscall_number: i64,
    args: SyscallArgs,
) -> SyscallReturn {
    if let Some(blocked_no) = ctx.thread.blocked_syscall_no {
        assert_eq!(
            blocked_no, syscall_number,
            "resumed a blocked thread with a different syscall number: expected {}, got {}",
            blocked_no, syscall_number
        );
    }

    let result = match class_of(syscall_number) {
        SyscallClass::Native => SyscallReturn::Native,
        SyscallClass::Unsupported => handlers::unsupported(syscall_number),
        SyscallClass::Handled => dispatch_handled(ctx, syscall_number, &args),
    };

    apply_signal_interruption_rule(ctx, result)
}

fn dispatch_handled<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    syscall_number: i64,
    args: &SyscallArgs,
) -> SyscallReturn {
    match syscall_number {
        numbers::NANOSLEEP => handlers::nanosleep(ctx, args),
        numbers::RT_SIGACTION => handlers::rt_sigaction(ctx, args),
        numbers::RT_SIGPROCMASK => handlers::rt_sigprocmask(ctx, args),
        numbers::SIGALTSTACK => handlers::sigaltstack(ctx, args),
        numbers::KILL => handlers::kill_like(ctx, args.as_i64(1) as i32, true),
        numbers::TGKILL | numbers::TKILL => handlers::kill_like(ctx, args.as_i64(2) as i32, false),
        numbers::CLOCK_GETTIME => handlers::clock_gettime(ctx, args),
        numbers::GETTIMEOFDAY => handlers::gettimeofday(ctx, args),
        numbers::TIME => handlers::time(ctx, args),
        numbers::GETPID => handlers::getpid(ctx),
        numbers::UNAME => handlers::uname(ctx, args),
        numbers::SET_TID_ADDRESS => handlers::set_tid_address(ctx, args),
        numbers::CLONE => handlers::clone_syscall(ctx, args),
        numbers::SHADOW_HOSTNAME_TO_ADDR_IPV4 => handlers::shadow_hostname_to_addr_ipv4(ctx, args),
        numbers::SHADOW_INIT_MEMORY_MANAGER => SyscallReturn::Done(0),
        numbers::SHADOW_YIELD => SyscallReturn::Done(0),
        n if numbers::is_shadow_syscall(n) => SyscallReturn::Done(0),
        numbers::READ => handlers::read(ctx, args),
        numbers::WRITE => handlers::write(ctx, args),
        numbers::FUTEX => handlers::futex(ctx, args),
        numbers::SELECT_OLD => handlers::select_old(ctx, args),
        numbers::PSELECT6 => handlers::pselect6(ctx, args),
        numbers::POLL => handlers::poll(ctx, args),
        numbers::PPOLL => handlers::ppoll(ctx, args),
        numbers::SYSINFO => handlers::sysinfo(ctx, args),
        numbers::SOCKET => handlers::socket(ctx),
        numbers::EPOLL_CREATE1 => handlers::epoll_create1(ctx),
        numbers::EPOLL_CTL => handlers::epoll_ctl(ctx, args),
        numbers::EPOLL_WAIT => handlers::epoll_wait(ctx, args),
        numbers::MMAP => handlers::mmap(ctx, args),
        numbers::MREMAP => handlers::mremap(ctx, args),
        numbers::MUNMAP => handlers::munmap(ctx, args),
        _ => SyscallReturn::Done(0),
    }
}

/// §4.3: if a handler's return would `Block` but the thread has an
/// unblocked-pending signal, transform it into `Interrupted`. Runs after
/// the handler attempts the operation, so a syscall that made progress
/// (`Done`/`Native`) is never spuriously interrupted.
fn apply_signal_interruption_rule<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    result: SyscallReturn,
) -> SyscallReturn {
    match result {
        SyscallReturn::Block(condition, restartable) => {
            if ctx.thread.signals.has_unblocked_pending() {
                SyscallReturn::Interrupted(restartable)
            } else {
                SyscallReturn::Block(condition, restartable)
            }
        }
        other => other,
    }
}

/// Decide whether staged guest-memory writes should be committed after a
/// dispatch result (§4.6): flushed only on a successful `Done`; discarded
/// for an error `Done`, a `Block`, or anything else.
pub fn should_flush_writes(result: &SyscallReturn) -> bool {
    matches!(result, SyscallReturn::Done(v) if *v >= 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::memory::{MemoryAccessor, MemoryBackend as _};
    use crate::process::Process;
    use crate::thread::{ManagedThread, TracingBackend};
    use nix::sys::wait::WaitStatus;
    use nix::unistd::Pid;
    use std::collections::HashMap;

    struct FakeBackend {
        mem: HashMap<u64, u8>,
        regs: libc::user_regs_struct,
    }

    impl FakeBackend {
        fn new() -> FakeBackend {
            FakeBackend { mem: HashMap::new(), regs: unsafe { std::mem::zeroed() } }
        }
    }

    impl crate::memory::MemoryBackend for FakeBackend {
        fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), crate::errno::CoreError> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *self.mem.get(&(addr + i as u64)).unwrap_or(&0);
            }
            Ok(())
        }
        fn write_at(&mut self, addr: u64, buf: &[u8]) -> Result<(), crate::errno::CoreError> {
            for (i, b) in buf.iter().enumerate() {
                self.mem.insert(addr + i as u64, *b);
            }
            Ok(())
        }
    }

    struct FakeTracingBackend;

    impl TracingBackend for FakeTracingBackend {
        fn fork_exec(
            &mut self,
            _argv: &[std::ffi::CString],
            _envp: &[std::ffi::CString],
        ) -> Result<Pid, crate::errno::CoreError> {
            Ok(Pid::from_raw(1))
        }
        fn wait_for_initial_stop(&mut self, _pid: Pid) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn setoptions(&mut self, _pid: Pid) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn attach(&mut self, _pid: Pid) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn detach(&mut self, _pid: Pid) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn cont_syscall(&mut self, _pid: Pid) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn sysemu(&mut self, _pid: Pid) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn singlestep(&mut self, _pid: Pid) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn get_regs(&mut self, _pid: Pid) -> Result<libc::user_regs_struct, crate::errno::CoreError> {
            Ok(unsafe { std::mem::zeroed() })
        }
        fn set_regs(&mut self, _pid: Pid, _regs: &libc::user_regs_struct) -> Result<(), crate::errno::CoreError> {
            Ok(())
        }
        fn try_wait(&mut self, _pid: Pid) -> Result<Option<WaitStatus>, crate::errno::CoreError> {
            Ok(None)
        }
        fn try_ipc_poll(&mut self) -> Option<()> {
            None
        }
    }

    #[test]
    fn flush_policy_matches_done_success_only() {
        assert!(should_flush_writes(&SyscallReturn::Done(0)));
        assert!(!should_flush_writes(&SyscallReturn::Done(-1)));
        assert!(!should_flush_writes(&SyscallReturn::Native));
    }

    #[test]
    #[should_panic]
    fn mismatched_resume_syscall_number_panics() {
        let mut thread = ManagedThread::new(FakeTracingBackend, Pid::from_raw(1), Pid::from_raw(1));
        thread.blocked_syscall_no = Some(numbers::NANOSLEEP);
        let mut process = Process::new(1);
        let mut memory = MemoryAccessor::new(FakeBackend::new());
        let config = SimulatorConfig::default();
        let mut ctx = DispatchContext {
            thread: &mut thread,
            process: &mut process,
            memory: &mut memory,
            config: &config,
            now_ns: 0,
            host_name: "host",
            host_default_addr_be: 0,
        };
        dispatch(&mut ctx, numbers::GETPID, SyscallArgs::new([0; 6]));
    }

    #[test]
    fn unsupported_syscall_returns_enosys() {
        let mut thread = ManagedThread::new(FakeTracingBackend, Pid::from_raw(1), Pid::from_raw(1));
        let mut process = Process::new(1);
        let mut memory = MemoryAccessor::new(FakeBackend::new());
        let config = SimulatorConfig::default();
        let mut ctx = DispatchContext {
            thread: &mut thread,
            process: &mut process,
            memory: &mut memory,
            config: &config,
            now_ns: 0,
            host_name: "host",
            host_default_addr_be: 0,
        };
        let result = dispatch(&mut ctx, numbers::SENDMMSG, SyscallArgs::new([0; 6]));
        match result {
            SyscallReturn::Done(v) => assert_eq!(v, crate::errno::GuestErrno::ENOSYS.as_neg_i64()),
            _ => panic!("expected Done(ENOSYS)"),
        }
    }
}
