//! `SyscallReturn` (§3): the tagged union every handler and the dispatcher
//! itself pass around. Exactly one tag is live at a time, which is why this
//! is an enum rather than a struct of optionals.

use crate::condition::SyscallCondition;

pub enum SyscallReturn {
    Done(i64),
    Block(SyscallCondition, bool),
    Native,
    Interrupted(bool),
}

impl SyscallReturn {
    pub fn done_ok(value: i64) -> SyscallReturn {
        SyscallReturn::Done(value)
    }

    pub fn done_err(errno: crate::errno::GuestErrno) -> SyscallReturn {
        SyscallReturn::Done(errno.as_neg_i64())
    }
}
