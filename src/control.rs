//! Control-Flow Glue (C8): `make_syscall`, the six-step algorithm from
//! SPEC_FULL.md §4.8 that ties dispatch (C6), the signal-interruption rule,
//! the unblocked-CPU-latency model, and guest-memory flush/discard
//! together for one syscall stop.

use crate::condition::SyscallCondition;
use crate::dispatch::{dispatch, should_flush_writes};
use crate::memory::{MemoryAccessor, MemoryBackend};
use crate::syscall::{numbers, DispatchContext, SyscallArgs, SyscallReturn};
use crate::thread::TracingBackend;

/// Per-host accumulator for the unblocked-syscall-latency model (§4.6).
/// Owned by the host, not the thread: every thread on a host contributes
/// to and drains the same synthetic CPU-cost budget.
#[derive(Default)]
pub struct LatencyTracker {
    accumulated_ns: u64,
}

impl LatencyTracker {
    pub fn new() -> LatencyTracker {
        LatencyTracker::default()
    }

    pub fn accumulated_ns(&self) -> u64 {
        self.accumulated_ns
    }

    fn accumulate(&mut self, latency_ns: u64) {
        self.accumulated_ns += latency_ns;
    }

    /// Drains and returns the accumulated latency once it exceeds `cap_ns`;
    /// `None` if still under the cap.
    fn drain_if_over_cap(&mut self, cap_ns: u64) -> Option<u64> {
        if self.accumulated_ns > cap_ns {
            let total = self.accumulated_ns;
            self.accumulated_ns = 0;
            Some(total)
        } else {
            None
        }
    }
}

/// `make_syscall`'s result: the tagged-union outcome plus how much
/// simulated time (if any) the embedding scheduler must advance before
/// resuming the thread (§4.6 unblocked-latency model: time advancement
/// itself is the scheduler's responsibility, this crate only computes the
/// amount).
pub struct MakeSyscallOutcome {
    pub result: SyscallReturn,
    pub advance_simulated_time_ns: u64,
}

/// Syscalls exempt from the unblocked-CPU-latency model: the private
/// simulator calls used to implement the model itself and to yield.
fn is_latency_exempt(syscall_number: i64) -> bool {
    numbers::is_shadow_syscall(syscall_number)
}

/// The six steps of §4.8, applied to one syscall stop.
pub fn make_syscall<B: TracingBackend, M: MemoryBackend>(
    ctx: &mut DispatchContext<B, M>,
    latency: &mut LatencyTracker,
    syscall_number: i64,
    args: SyscallArgs,
) -> MakeSyscallOutcome {
    // Step 1: a deferred latency-model result is returned without
    // re-running the handler.
    if let Some(value) = ctx.thread.pending_result.take() {
        ctx.thread.clear_block();
        return MakeSyscallOutcome { result: SyscallReturn::Done(value), advance_simulated_time_ns: 0 };
    }

    // Steps 2-3: dispatch, then the signal-interruption rule (applied
    // inside `dispatch` itself, after the handler returns).
    let mut result = dispatch(ctx, syscall_number, args);

    // Step 4: the latency model, which can convert a successful `Done`
    // into a `Block` with a synthetic timeout.
    let mut advance_ns = 0u64;
    if let SyscallReturn::Done(value) = result {
        if value >= 0 && !is_latency_exempt(syscall_number) {
            latency.accumulate(ctx.config.unblocked_syscall_latency_ns);
            if let Some(total) = latency.drain_if_over_cap(ctx.config.unblocked_latency_cap_ns) {
                if total <= ctx.config.runahead_window_ns {
                    advance_ns = total;
                } else {
                    ctx.thread.pending_result = Some(value);
                    let deadline = ctx.now_ns + (total - ctx.config.runahead_window_ns);
                    let condition = SyscallCondition::new(Vec::new(), Some(deadline), false);
                    result = SyscallReturn::Block(condition, false);
                }
            }
        }
    }

    // Step 5: flush or discard staged guest-memory writes based on the
    // final result.
    if should_flush_writes(&result) {
        ctx.memory.flush().expect("guest-memory write flush failed: treated as a fatal core invariant violation");
    } else {
        ctx.memory.discard();
    }

    // Step 6: blocked-syscall-number bookkeeping.
    let outcome_result = match result {
        SyscallReturn::Block(condition, restartable) => {
            ctx.thread.blocked_syscall_no = Some(syscall_number);
            ctx.thread.condition = Some(condition.clone());
            SyscallReturn::Block(condition, restartable)
        }
        other => {
            ctx.thread.clear_block();
            other
        }
    };

    MakeSyscallOutcome { result: outcome_result, advance_simulated_time_ns: advance_ns }
}
