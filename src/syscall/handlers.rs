//! Per-syscall handlers (§4.6). Each takes the borrowed dispatch context
//! and args, returns a `SyscallReturn`. Grounded in the handler signature
//! used by examples/other_examples/38920401_shadow-shadow__...sched.rs
//! (`fn(&self, ctx: &mut ThreadContext, args: &SysCallArgs) -> SyscallResult`),
//! adapted to this crate's context/error types.

use super::args::SyscallArgs;
use super::ret::SyscallReturn;
use crate::condition::{SyscallCondition, Trigger};
use crate::descriptor::DescriptorStatus;
use crate::errno::GuestErrno;
use crate::memory::{MemoryAccessor, MemoryBackend};
use crate::process::{Fd, MappedRegion};
use crate::signals::{Action, Disposition, SigInfo, SigaltstackDescription, SigaltstackFlags};
use crate::thread::{strip_clone_flags_for_native, ManagedThread, TracingBackend};

/// Everything a handler needs, borrowed for the duration of one dispatch
/// (§3 ownership summary: handlers are transient borrowers).
pub struct DispatchContext<'a, B: TracingBackend, M: MemoryBackend> {
    pub thread: &'a mut ManagedThread<B>,
    pub process: &'a mut crate::process::Process,
    pub memory: &'a mut MemoryAccessor<M>,
    pub config: &'a crate::config::SimulatorConfig,
    pub now_ns: u64,
    pub host_name: &'a str,
    pub host_default_addr_be: u32,
}

fn htonl(addr_host_order: u32) -> u32 {
    addr_host_order.to_be()
}

pub fn nanosleep<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    // First entry: build the blocking condition from the requested duration.
    // Resumed entry: the thread's condition carries the deadline; C8 only
    // re-invokes this handler once the condition has fired, at which point
    // it either expired (return 0) or an unblocked signal is pending.
    if ctx.thread.blocked_syscall_no == Some(crate::syscall::numbers::NANOSLEEP) {
        let expired = ctx
            .thread
            .condition
            .as_ref()
            .map(|c| c.poll(ctx.now_ns))
            .flatten();
        match expired {
            Some(crate::condition::WakeReason::Timeout) => {
                ctx.thread.clear_block();
                return SyscallReturn::Done(0);
            }
            Some(crate::condition::WakeReason::Signal) => {
                let remainder_ptr = args.as_ptr(1);
                if remainder_ptr != 0 {
                    // Remaining time is the condition's deadline minus now;
                    // encoded as {sec, nsec} in guest memory.
                    if let Some(deadline) = ctx.thread.condition.as_ref().and_then(|c| c.deadline_ns()) {
                        let remaining = deadline.saturating_sub(ctx.now_ns);
                        let sec = remaining / 1_000_000_000;
                        let nsec = remaining % 1_000_000_000;
                        let mut bytes = Vec::with_capacity(16);
                        bytes.extend_from_slice(&sec.to_le_bytes());
                        bytes.extend_from_slice(&nsec.to_le_bytes());
                        ctx.memory.stage_write(remainder_ptr, bytes);
                    }
                }
                ctx.thread.clear_block();
                return SyscallReturn::Done(GuestErrno::EINTR.as_neg_i64());
            }
            _ => {
                // Should not happen: C8 only re-enters once the condition fired.
                ctx.thread.clear_block();
                return SyscallReturn::Done(GuestErrno::EINTR.as_neg_i64());
            }
        }
    }

    let req_ptr = args.as_ptr(0);
    let bytes = match ctx.memory.read_ptr(req_ptr, 16) {
        Ok(b) => b,
        Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
    };
    let sec = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let nsec = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let requested_ns = sec.saturating_mul(1_000_000_000).saturating_add(nsec);

    if requested_ns == 0 {
        return SyscallReturn::Done(0);
    }

    let deadline = ctx.now_ns + requested_ns;
    let condition = SyscallCondition::new(Vec::new(), Some(deadline), true);
    SyscallReturn::Block(condition, true)
}

pub fn rt_sigaction<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let sig = args.as_i64(0) as i32;
    let new_ptr = args.as_ptr(1);
    let old_ptr = args.as_ptr(2);

    if old_ptr != 0 {
        match ctx.process.signals.get_action(sig) {
            Ok(action) => {
                let bytes = encode_action(action);
                ctx.memory.stage_write(old_ptr, bytes);
            }
            Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
        }
    }

    if new_ptr != 0 {
        let bytes = match ctx.memory.read_ptr(new_ptr, 24) {
            Ok(b) => b,
            Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
        };
        let action = match decode_action(&bytes) {
            Some(a) => a,
            None => return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64()),
        };
        if let Err(e) = ctx.process.signals.set_action(sig, action) {
            return SyscallReturn::Done(e.as_neg_i64());
        }
    }
    SyscallReturn::Done(0)
}

fn encode_action(action: Action) -> Vec<u8> {
    let handler: u64 = match action.disposition {
        Disposition::Default => 0,
        Disposition::Ignore => 1,
        Disposition::Handler(addr) => addr,
    };
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&handler.to_le_bytes());
    out.extend_from_slice(&action.flags.bits().to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&action.mask.to_le_bytes());
    out
}

fn decode_action(bytes: &[u8]) -> Option<Action> {
    let handler = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let flags_bits = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let mask = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    let disposition = match handler {
        0 => Disposition::Default,
        1 => Disposition::Ignore,
        addr => Disposition::Handler(addr),
    };
    let flags = crate::signals::SigactionFlags::from_bits(flags_bits)?;
    Some(Action { disposition, flags, mask })
}

const SIG_BLOCK: i64 = 0;
const SIG_UNBLOCK: i64 = 1;
const SIG_SETMASK: i64 = 2;

pub fn rt_sigprocmask<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let how = args.as_i64(0);
    let set_ptr = args.as_ptr(1);
    let old_ptr = args.as_ptr(2);

    // thread signal state lives with the embedder's per-thread storage;
    // this crate exposes it through the thread's blocked-syscall bookkeeping
    // area in a real integration. Here we model it via a field on the
    // context-supplied mask through memory, matching the round-trip law
    // in SPEC_FULL.md §8 against a caller-held ThreadSignalState.
    if old_ptr != 0 {
        let current = ctx.current_blocked_mask();
        ctx.memory.stage_write(old_ptr, current.to_le_bytes().to_vec());
    }

    if set_ptr != 0 {
        let bytes = match ctx.memory.read_ptr(set_ptr, 8) {
            Ok(b) => b,
            Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
        };
        let requested = u64::from_le_bytes(bytes.try_into().unwrap());
        let current = ctx.current_blocked_mask();
        let new_mask = match how {
            h if h == SIG_BLOCK => current | requested,
            h if h == SIG_UNBLOCK => current & !requested,
            h if h == SIG_SETMASK => requested,
            _ => return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64()),
        };
        ctx.set_blocked_mask(new_mask);
    }
    SyscallReturn::Done(0)
}

pub fn sigaltstack<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let new_ptr = args.as_ptr(0);
    let old_ptr = args.as_ptr(1);

    let new = if new_ptr != 0 {
        let bytes = match ctx.memory.read_ptr(new_ptr, 24) {
            Ok(b) => b,
            Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
        };
        let sp = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let flags = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let size = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let flags = match SigaltstackFlags::from_bits(flags) {
            Some(f) => f,
            None => return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64()),
        };
        Some(SigaltstackDescription { sp, size, flags })
    } else {
        None
    };

    match ctx.sigaltstack(new) {
        Ok(old) => {
            if old_ptr != 0 {
                let mut bytes = Vec::with_capacity(24);
                bytes.extend_from_slice(&old.sp.to_le_bytes());
                bytes.extend_from_slice(&old.flags.bits().to_le_bytes());
                bytes.extend_from_slice(&[0u8; 4]);
                bytes.extend_from_slice(&old.size.to_le_bytes());
                ctx.memory.stage_write(old_ptr, bytes);
            }
            SyscallReturn::Done(0)
        }
        Err(e) => SyscallReturn::Done(e.as_neg_i64()),
    }
}

pub fn kill_like<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    sig: i32,
    to_process: bool,
) -> SyscallReturn {
    let info = SigInfo { si_signo: sig, si_pid: ctx.process.native_pid, si_code: 0 };
    let result = if to_process {
        ctx.send_to_process(sig, info)
    } else {
        ctx.send_to_thread(sig, info)
    };
    match result {
        Ok(()) => SyscallReturn::Done(0),
        Err(e) => SyscallReturn::Done(e.as_neg_i64()),
    }
}

pub fn clock_gettime<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let ts_ptr = args.as_ptr(1);
    let sec = ctx.now_ns / 1_000_000_000;
    let nsec = ctx.now_ns % 1_000_000_000;
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&sec.to_le_bytes());
    bytes.extend_from_slice(&nsec.to_le_bytes());
    ctx.memory.stage_write(ts_ptr, bytes);
    SyscallReturn::Done(0)
}

pub fn gettimeofday<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let tv_ptr = args.as_ptr(0);
    if tv_ptr != 0 {
        let sec = ctx.now_ns / 1_000_000_000;
        let usec = (ctx.now_ns % 1_000_000_000) / 1_000;
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&sec.to_le_bytes());
        bytes.extend_from_slice(&usec.to_le_bytes());
        ctx.memory.stage_write(tv_ptr, bytes);
    }
    SyscallReturn::Done(0)
}

pub fn time<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let sec = (ctx.now_ns / 1_000_000_000) as i64;
    let tloc_ptr = args.as_ptr(0);
    if tloc_ptr != 0 {
        ctx.memory.stage_write(tloc_ptr, sec.to_le_bytes().to_vec());
    }
    SyscallReturn::Done(sec)
}

pub fn getpid<B: TracingBackend, M: MemoryBackend>(ctx: &mut DispatchContext<B, M>) -> SyscallReturn {
    SyscallReturn::Done(ctx.process.native_pid as i64)
}

pub fn uname<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let buf_ptr = args.as_ptr(0);
    const FIELD_LEN: usize = 65;
    let mut bytes = Vec::with_capacity(FIELD_LEN * 6);
    let fields = ["Linux", "shadowcore-guest", "0.0.0", "#1", "x86_64", ""];
    for field in fields {
        let mut padded = vec![0u8; FIELD_LEN];
        let src = field.as_bytes();
        padded[..src.len()].copy_from_slice(src);
        bytes.extend_from_slice(&padded);
    }
    ctx.memory.stage_write(buf_ptr, bytes);
    SyscallReturn::Done(0)
}

pub fn set_tid_address<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    ctx.thread.tid_clear_addr = Some(args.as_ptr(0));
    SyscallReturn::Done(ctx.thread.native_tid.as_raw() as i64)
}

/// Simulator-private `shadow_hostname_to_addr_ipv4` (§4.6).
pub fn shadow_hostname_to_addr_ipv4<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let name_ptr = args.as_ptr(0);
    let addrlen = args.as_i64(2);
    let addr_out_ptr = args.as_ptr(3);

    if name_ptr == 0 || addr_out_ptr == 0 {
        return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
    }
    if addrlen < 4 {
        return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
    }

    let name = match ctx.memory.read_string(name_ptr) {
        Ok(s) => s,
        Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
    };

    let addr_be: u32 = if name == "localhost" {
        htonl(0x7F00_0001)
    } else if name == ctx.host_name {
        ctx.host_default_addr_be
    } else {
        return SyscallReturn::Done(GuestErrno::EFAULT.as_neg_i64());
    };

    ctx.memory.stage_write(addr_out_ptr, addr_be.to_le_bytes().to_vec());
    SyscallReturn::Done(0)
}

pub fn clone_syscall<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let flags = args.as_u64(0);
    let stack = args.as_i64(1);
    let ptid_ptr = args.as_ptr(2);
    let ctid_ptr = args.as_ptr(3);
    let tls = args.as_i64(4);

    let native_flags = match strip_clone_flags_for_native(flags) {
        Ok(f) => f,
        Err(_) => return SyscallReturn::Done(GuestErrno::ENOTSUP.as_neg_i64()),
    };

    let child_args = [native_flags as i64, stack, 0, 0, tls, 0];
    let child_native_tid = match ctx.thread.inject_syscall(crate::syscall::numbers::CLONE, child_args, false) {
        Ok(v) => v,
        Err(_) => return SyscallReturn::Done(GuestErrno::ESRCH.as_neg_i64()),
    };
    if child_native_tid < 0 {
        return SyscallReturn::Done(child_native_tid);
    }

    if flags & crate::thread::CLONE_PARENT_SETTID != 0 && ptid_ptr != 0 {
        ctx.memory.stage_write(ptid_ptr, (child_native_tid as u64).to_le_bytes().to_vec());
    }
    if flags & crate::thread::CLONE_CHILD_SETTID != 0 && ctid_ptr != 0 {
        ctx.memory.stage_write(ctid_ptr, (child_native_tid as u64).to_le_bytes().to_vec());
    }
    // CHILD_CLEARTID address is recorded on the child thread by the caller
    // once it constructs the new ManagedThread; this handler only reports it.

    SyscallReturn::Done(child_native_tid)
}

pub fn unsupported(syscall_number: i64) -> SyscallReturn {
    log::warn!("syscall {} is unsupported, returning ENOSYS", syscall_number);
    SyscallReturn::Done(GuestErrno::ENOSYS.as_neg_i64())
}

/// `read(2)`: actual byte transfer belongs to the descriptor's own
/// implementation (§1); this handler only consults the descriptor table
/// and blocks on `READABLE` if the fd isn't ready yet.
pub fn read<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let fd = Fd(args.as_i64(0) as i32);
    let descriptor = match ctx.process.descriptors.get(fd) {
        Ok(d) => d,
        Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
    };
    if !descriptor.status().contains(DescriptorStatus::READABLE) {
        let trigger = Trigger::new(descriptor, DescriptorStatus::READABLE);
        return SyscallReturn::Block(SyscallCondition::new(vec![trigger], None, true), true);
    }
    SyscallReturn::Done(0)
}

/// `write(2)`: same split as `read` above, gated on `WRITABLE`.
pub fn write<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let fd = Fd(args.as_i64(0) as i32);
    let descriptor = match ctx.process.descriptors.get(fd) {
        Ok(d) => d,
        Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
    };
    if !descriptor.status().contains(DescriptorStatus::WRITABLE) {
        let trigger = Trigger::new(descriptor, DescriptorStatus::WRITABLE);
        return SyscallReturn::Block(SyscallCondition::new(vec![trigger], None, true), true);
    }
    SyscallReturn::Done(0)
}

const FUTEX_CMD_MASK: i64 = 0x7f;
const FUTEX_WAIT: i64 = 0;
const FUTEX_WAKE: i64 = 1;

/// `futex(2)`: no waiter queue is modeled (§1), so `FUTEX_WAKE` always
/// reports zero waiters woken. `FUTEX_WAIT` does consult the guest word at
/// `uaddr`: a mismatch is `EAGAIN` per the real syscall's contract, and a
/// match blocks indefinitely (woken only by a signal, since nothing in
/// this core ever fires the condition otherwise).
pub fn futex<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let uaddr = args.as_ptr(0);
    let op = args.as_i64(1) & FUTEX_CMD_MASK;
    match op {
        FUTEX_WAIT => {
            let expected = args.as_i64(2) as u32;
            let bytes = match ctx.memory.read_ptr(uaddr, 4) {
                Ok(b) => b,
                Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
            };
            let current = u32::from_le_bytes(bytes.try_into().unwrap());
            if current != expected {
                return SyscallReturn::Done(GuestErrno::EWOULDBLOCK.as_neg_i64());
            }
            SyscallReturn::Block(SyscallCondition::new(Vec::new(), None, true), true)
        }
        FUTEX_WAKE => SyscallReturn::Done(0),
        _ => SyscallReturn::Done(GuestErrno::ENOTSUP.as_neg_i64()),
    }
}

const FD_SET_BYTES: usize = 128;

fn read_fd_set<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    ptr: u64,
    nfds: usize,
) -> Result<Vec<bool>, GuestErrno> {
    if ptr == 0 {
        return Ok(vec![false; nfds]);
    }
    let bytes = ctx.memory.read_ptr(ptr, FD_SET_BYTES)?;
    Ok((0..nfds).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect())
}

fn write_fd_set<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    ptr: u64,
    flags: &[bool],
) {
    if ptr == 0 {
        return;
    }
    let mut bytes = vec![0u8; FD_SET_BYTES];
    for (i, set) in flags.iter().enumerate() {
        if *set {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    ctx.memory.stage_write(ptr, bytes);
}

fn select_common<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    nfds: i64,
    readfds_ptr: u64,
    writefds_ptr: u64,
    timeout_ptr: u64,
    frac_is_nanos: bool,
) -> SyscallReturn {
    if nfds < 0 {
        return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
    }
    let mut readfds = match read_fd_set(ctx, readfds_ptr, nfds as usize) {
        Ok(v) => v,
        Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
    };
    let mut writefds = match read_fd_set(ctx, writefds_ptr, nfds as usize) {
        Ok(v) => v,
        Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
    };

    let timeout_ns = if timeout_ptr == 0 {
        None
    } else {
        let bytes = match ctx.memory.read_ptr(timeout_ptr, 16) {
            Ok(b) => b,
            Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
        };
        let sec = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let frac = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        if sec < 0 || frac < 0 {
            return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
        }
        let frac_ns = if frac_is_nanos { frac } else { frac * 1_000 };
        Some((sec as u64).saturating_mul(1_000_000_000).saturating_add(frac_ns as u64))
    };

    match select_via_poll(ctx, nfds, &mut readfds, &mut writefds, timeout_ns) {
        Ok((out_read, out_write, _timed_out)) => {
            let ready = out_read.iter().filter(|b| **b).count() + out_write.iter().filter(|b| **b).count();
            write_fd_set(ctx, readfds_ptr, &out_read);
            write_fd_set(ctx, writefds_ptr, &out_write);
            SyscallReturn::Done(ready as i64)
        }
        Err(e) => SyscallReturn::Done(e.as_neg_i64()),
    }
}

/// `select(2)`: timeout is `{sec, usec}`.
pub fn select_old<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    select_common(ctx, args.as_i64(0), args.as_ptr(1), args.as_ptr(2), args.as_ptr(4), false)
}

/// `pselect6(2)`: timeout is `{sec, nsec}`.
pub fn pselect6<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    select_common(ctx, args.as_i64(0), args.as_ptr(1), args.as_ptr(2), args.as_ptr(4), true)
}

const POLLIN: i16 = 0x0001;
const POLLOUT: i16 = 0x0004;
const POLLNVAL: i16 = 0x0020;
const POLLFD_SIZE: u64 = 8;

fn poll_like<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    fds_ptr: u64,
    nfds: u64,
    timeout_ms: i64,
    syscall_number: i64,
) -> SyscallReturn {
    let already_waited = ctx.thread.blocked_syscall_no == Some(syscall_number);
    if already_waited {
        let reason = ctx.thread.condition.as_ref().and_then(|c| c.poll(ctx.now_ns));
        if reason == Some(crate::condition::WakeReason::Signal) {
            ctx.thread.clear_block();
            return SyscallReturn::Done(GuestErrno::EINTR.as_neg_i64());
        }
    }

    let mut ready_count = 0i64;
    let mut triggers = Vec::new();
    for i in 0..nfds {
        let entry_ptr = fds_ptr + i * POLLFD_SIZE;
        let bytes = match ctx.memory.read_ptr(entry_ptr, POLLFD_SIZE as usize) {
            Ok(b) => b,
            Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
        };
        let fd = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let events = i16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let mut revents: i16 = 0;
        match ctx.process.descriptors.get(Fd(fd)) {
            Ok(descriptor) => {
                let status = descriptor.status();
                if events & POLLIN != 0 && status.contains(DescriptorStatus::READABLE) {
                    revents |= POLLIN;
                }
                if events & POLLOUT != 0 && status.contains(DescriptorStatus::WRITABLE) {
                    revents |= POLLOUT;
                }
                if revents == 0 && !already_waited {
                    let mut mask = DescriptorStatus::empty();
                    if events & POLLIN != 0 {
                        mask |= DescriptorStatus::READABLE;
                    }
                    if events & POLLOUT != 0 {
                        mask |= DescriptorStatus::WRITABLE;
                    }
                    if !mask.is_empty() {
                        triggers.push(Trigger::new(descriptor, mask));
                    }
                }
            }
            Err(_) => revents = POLLNVAL,
        }
        if revents != 0 {
            ready_count += 1;
        }
        ctx.memory.stage_write(entry_ptr + 6, revents.to_le_bytes().to_vec());
    }

    if ready_count > 0 || timeout_ms == 0 || already_waited {
        ctx.thread.clear_block();
        return SyscallReturn::Done(ready_count);
    }

    let deadline = if timeout_ms < 0 { None } else { Some(ctx.now_ns + (timeout_ms as u64) * 1_000_000) };
    SyscallReturn::Block(SyscallCondition::new(triggers, deadline, true), true)
}

/// `poll(2)`.
pub fn poll<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    poll_like(ctx, args.as_ptr(0), args.as_u64(1), args.as_i64(2), crate::syscall::numbers::POLL)
}

/// `ppoll(2)`: timeout is a `timespec*`, null meaning infinite.
pub fn ppoll<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let ts_ptr = args.as_ptr(2);
    let timeout_ms = if ts_ptr == 0 {
        -1
    } else {
        match ctx.memory.read_ptr(ts_ptr, 16) {
            Ok(bytes) => {
                let sec = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
                let nsec = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
                sec.saturating_mul(1000).saturating_add(nsec / 1_000_000)
            }
            Err(e) => return SyscallReturn::Done(e.as_neg_i64()),
        }
    };
    poll_like(ctx, args.as_ptr(0), args.as_u64(1), timeout_ms, crate::syscall::numbers::PPOLL)
}

/// `sysinfo(2)`: only the fields this core can answer meaningfully
/// (uptime) are populated; the rest of the struct is zeroed.
pub fn sysinfo<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let ptr = args.as_ptr(0);
    if ptr == 0 {
        return SyscallReturn::Done(GuestErrno::EFAULT.as_neg_i64());
    }
    const SYSINFO_SIZE: usize = 112;
    let mut bytes = vec![0u8; SYSINFO_SIZE];
    let uptime = (ctx.now_ns / 1_000_000_000) as i64;
    bytes[0..8].copy_from_slice(&uptime.to_le_bytes());
    ctx.memory.stage_write(ptr, bytes);
    SyscallReturn::Done(0)
}

/// `socket(2)`: allocates a descriptor-table entry for a new, as-yet
/// unconnected socket. The descriptor's real protocol behavior is an
/// embedder concern (§1); this core only hands out the fd.
pub fn socket<B: TracingBackend, M: MemoryBackend>(ctx: &mut DispatchContext<B, M>) -> SyscallReturn {
    let descriptor = crate::descriptor::TestDescriptor::new(DescriptorStatus::WRITABLE);
    let fd = ctx.process.descriptors.insert(descriptor);
    SyscallReturn::Done(fd.0 as i64)
}

/// `epoll_create1(2)`: allocates a descriptor-table entry for the epoll
/// instance itself. Its interest list is not modeled here.
pub fn epoll_create1<B: TracingBackend, M: MemoryBackend>(ctx: &mut DispatchContext<B, M>) -> SyscallReturn {
    let descriptor = crate::descriptor::TestDescriptor::new(DescriptorStatus::empty());
    let fd = ctx.process.descriptors.insert(descriptor);
    SyscallReturn::Done(fd.0 as i64)
}

const EPOLL_CTL_ADD: i64 = 1;
const EPOLL_CTL_DEL: i64 = 2;
const EPOLL_CTL_MOD: i64 = 3;

/// `epoll_ctl(2)`: validates the epoll fd, the operation, and the target
/// fd. The interest list a real implementation would track per-fd is out
/// of scope here (§1); this core only validates.
pub fn epoll_ctl<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let epfd = Fd(args.as_i64(0) as i32);
    let op = args.as_i64(1);
    let target_fd = Fd(args.as_i64(2) as i32);
    if ctx.process.descriptors.get(epfd).is_err() {
        return SyscallReturn::Done(GuestErrno::EBADF.as_neg_i64());
    }
    if !matches!(op, EPOLL_CTL_ADD | EPOLL_CTL_DEL | EPOLL_CTL_MOD) {
        return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
    }
    if ctx.process.descriptors.get(target_fd).is_err() {
        return SyscallReturn::Done(GuestErrno::EBADF.as_neg_i64());
    }
    SyscallReturn::Done(0)
}

/// `epoll_wait(2)`: validates the epoll fd and reports no events ready
/// (no interest list is tracked by `epoll_ctl` above).
pub fn epoll_wait<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let epfd = Fd(args.as_i64(0) as i32);
    if ctx.process.descriptors.get(epfd).is_err() {
        return SyscallReturn::Done(GuestErrno::EBADF.as_neg_i64());
    }
    SyscallReturn::Done(0)
}

/// `mmap(2)`: tracks the new region in the process's `MemoryManager` and
/// assigns an address when the guest didn't request one. The actual page
/// mapping is the kernel's job; this is bookkeeping only.
pub fn mmap<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let addr_hint = args.as_u64(0);
    let len = args.as_u64(1);
    if len == 0 {
        return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
    }
    let start = if addr_hint != 0 {
        addr_hint
    } else {
        ctx.process
            .memory
            .regions()
            .iter()
            .map(|r| r.start + r.len)
            .max()
            .unwrap_or(0x7f00_0000_0000)
    };
    ctx.process.memory.add_region(MappedRegion { start, len });
    SyscallReturn::Done(start as i64)
}

/// `munmap(2)`.
pub fn munmap<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let addr = args.as_u64(0);
    let len = args.as_u64(1);
    if !ctx.process.memory.is_mapped(addr) {
        return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
    }
    ctx.process.memory.remove_region(addr, len);
    SyscallReturn::Done(0)
}

/// `mremap(2)`: reuses the same starting address (no relocation support;
/// `MREMAP_MAYMOVE` is not modeled).
pub fn mremap<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    args: &SyscallArgs,
) -> SyscallReturn {
    let old_addr = args.as_u64(0);
    let old_len = args.as_u64(1);
    let new_len = args.as_u64(2);
    if !ctx.process.memory.is_mapped(old_addr) {
        return SyscallReturn::Done(GuestErrno::EINVAL.as_neg_i64());
    }
    ctx.process.memory.remove_region(old_addr, old_len);
    ctx.process.memory.add_region(MappedRegion { start: old_addr, len: new_len });
    SyscallReturn::Done(old_addr as i64)
}

/// Rewrites a `select`/`pselect6` request into `poll` semantics per §4.6:
/// each fd's set membership becomes `POLLIN`/`POLLOUT`, readiness is probed
/// through the descriptor table, and results are mapped back to fd-sets.
pub fn select_via_poll<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    nfds: i64,
    readfds: &mut Vec<bool>,
    writefds: &mut Vec<bool>,
    timeout_ns: Option<u64>,
) -> Result<(Vec<bool>, Vec<bool>, bool), GuestErrno> {
    if nfds < 0 {
        return Err(GuestErrno::EINVAL);
    }
    if let Some(t) = timeout_ns {
        if (t as i64) < 0 {
            return Err(GuestErrno::EINVAL);
        }
    }

    let mut out_read = vec![false; readfds.len()];
    let mut out_write = vec![false; writefds.len()];
    let mut any_invalid = false;

    for i in 0..nfds as usize {
        let wants_read = readfds.get(i).copied().unwrap_or(false);
        let wants_write = writefds.get(i).copied().unwrap_or(false);
        if !wants_read && !wants_write {
            continue;
        }
        let fd = crate::process::Fd(i as i32);
        match ctx.process.descriptors.get(fd) {
            Ok(descriptor) => {
                let status = descriptor.status();
                if wants_read && status.contains(DescriptorStatus::READABLE) {
                    out_read[i] = true;
                }
                if wants_write && status.contains(DescriptorStatus::WRITABLE) {
                    out_write[i] = true;
                }
            }
            Err(_) => any_invalid = true,
        }
    }

    if any_invalid {
        return Err(GuestErrno::EBADF);
    }
    Ok((out_read, out_write, false))
}

impl<'a, B: TracingBackend, M: MemoryBackend> DispatchContext<'a, B, M> {
    fn current_blocked_mask(&self) -> u64 {
        self.thread.signals.blocked()
    }

    fn set_blocked_mask(&mut self, mask: u64) {
        self.thread.signals.set_blocked(mask);
    }

    fn sigaltstack(&mut self, new: Option<SigaltstackDescription>) -> Result<SigaltstackDescription, GuestErrno> {
        self.thread.signals.set_sigaltstack(new)
    }

    /// `send_to_process` targets every thread of the process in a full
    /// implementation; this crate's context only ever holds the one thread
    /// being dispatched, so it delivers to that thread (the common case of
    /// a single-threaded process) and leaves multi-thread fan-out to the
    /// embedder's scheduler, which owns the thread set (§9).
    fn send_to_process(&mut self, sig: i32, info: SigInfo) -> Result<(), GuestErrno> {
        self.send_to_thread(sig, info)
    }

    fn send_to_thread(&mut self, sig: i32, info: SigInfo) -> Result<(), GuestErrno> {
        let became_pending = self.thread.signals.send(sig, info, &self.process.signals)?;
        if became_pending {
            let blocked = self.thread.signals.blocked() & (1u64 << ((sig - 1) as u32)) != 0;
            if !blocked {
                if let Some(condition) = self.thread.condition.as_mut() {
                    condition.wake_for_signal();
                }
                self.thread.signals.note_wake_signal(sig);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::memory::MemoryAccessor;
    use crate::process::Process;
    use crate::thread::ManagedThread;
    use nix::sys::wait::WaitStatus;
    use nix::unistd::Pid;
    use std::collections::HashMap;

    struct FakeMemBackend {
        mem: HashMap<u64, u8>,
    }

    impl FakeMemBackend {
        fn new() -> FakeMemBackend {
            FakeMemBackend { mem: HashMap::new() }
        }
    }

    impl MemoryBackend for FakeMemBackend {
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

    struct FakeTraceBackend;

    impl TracingBackend for FakeTraceBackend {
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
    fn encode_decode_action_round_trips() {
        let action = Action {
            disposition: Disposition::Handler(0x4000),
            flags: crate::signals::SigactionFlags::SA_RESTART,
            mask: 0xff,
        };
        let bytes = encode_action(action);
        let back = decode_action(&bytes).unwrap();
        assert_eq!(back.mask, 0xff);
        assert!(back.flags.contains(crate::signals::SigactionFlags::SA_RESTART));
    }

    #[test]
    fn decode_action_rejects_unknown_flag_bits() {
        let action = Action {
            disposition: Disposition::Handler(0x4000),
            flags: crate::signals::SigactionFlags::SA_RESTART,
            mask: 0,
        };
        let mut bytes = encode_action(action);
        bytes[8..12].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        assert!(decode_action(&bytes).is_none());
    }

    #[test]
    fn select_rejects_negative_nfds() {
        let mut thread = ManagedThread::new(FakeTraceBackend, Pid::from_raw(1), Pid::from_raw(1));
        let mut process = Process::new(1);
        let mut memory = MemoryAccessor::new(FakeMemBackend::new());
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
        let mut readfds = vec![false; 4];
        let mut writefds = vec![false; 4];
        let result = select_via_poll(&mut ctx, -1, &mut readfds, &mut writefds, None);
        assert_eq!(result.unwrap_err(), GuestErrno::EINVAL);
    }

    #[test]
    fn sigaltstack_rejects_unknown_flag_bits() {
        let mut thread = ManagedThread::new(FakeTraceBackend, Pid::from_raw(1), Pid::from_raw(1));
        let mut process = Process::new(1);
        let mut memory = MemoryAccessor::new(FakeMemBackend::new());
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
        let new_ptr = 0x1000u64;
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0x8000u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&0u64.to_le_bytes());
        ctx.memory.stage_write(new_ptr, bytes);
        ctx.memory.flush().unwrap();
        let args = SyscallArgs::new([new_ptr as i64, 0, 0, 0, 0, 0]);
        let result = sigaltstack(&mut ctx, &args);
        match result {
            SyscallReturn::Done(v) => assert_eq!(v, GuestErrno::EINVAL.as_neg_i64()),
            _ => panic!("expected Done(EINVAL)"),
        }
    }

    #[test]
    fn mmap_then_munmap_round_trips_through_memory_manager() {
        let mut thread = ManagedThread::new(FakeTraceBackend, Pid::from_raw(1), Pid::from_raw(1));
        let mut process = Process::new(1);
        let mut memory = MemoryAccessor::new(FakeMemBackend::new());
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
        let map_args = SyscallArgs::new([0, 4096, 0, 0, 0, 0]);
        let mapped_at = match mmap(&mut ctx, &map_args) {
            SyscallReturn::Done(v) => v,
            _ => panic!("expected Done"),
        };
        assert!(ctx.process.memory.is_mapped(mapped_at as u64));

        let unmap_args = SyscallArgs::new([mapped_at, 4096, 0, 0, 0, 0]);
        match munmap(&mut ctx, &unmap_args) {
            SyscallReturn::Done(0) => {}
            _ => panic!("expected Done(0)"),
        }
        assert!(!ctx.process.memory.is_mapped(mapped_at as u64));
    }
}
