//! Typed-ish view over the raw `{rdi,rsi,rdx,r10,r8,r9}` syscall arguments,
//! mirroring the `args.get(N).as_i64/as_ptr` style the upstream handler
//! (examples/other_examples/38920401_...syscall-handler-sched.rs) uses.

#[derive(Copy, Clone, Debug)]
pub struct SyscallArgs {
    raw: [i64; 6],
}

impl SyscallArgs {
    pub fn new(raw: [i64; 6]) -> SyscallArgs {
        SyscallArgs { raw }
    }

    pub fn as_i64(&self, index: usize) -> i64 {
        self.raw[index]
    }

    pub fn as_u64(&self, index: usize) -> u64 {
        self.raw[index] as u64
    }

    pub fn as_ptr(&self, index: usize) -> u64 {
        self.raw[index] as u64
    }

    pub fn raw(&self) -> [i64; 6] {
        self.raw
    }
}
