//! Host identity and the explicit "current host/process/thread" context
//! (SPEC_FULL.md §9: must be passed explicitly, never a process-wide
//! singleton). Handlers borrow a `HostContext` for the duration of one
//! dispatch and never retain it past that (§3 ownership summary).

use crate::process::Process;
use crate::thread::{ManagedThread, TracingBackend};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct HostId(pub u32);

/// Borrowed bundle a syscall handler receives. Lifetimes tie it to the
/// single dispatch call that constructs it; nothing here is cloned or
/// stored beyond that call.
pub struct HostContext<'a, B: TracingBackend> {
    pub host_id: HostId,
    pub process: &'a mut Process,
    pub thread: &'a mut ManagedThread<B>,
}
