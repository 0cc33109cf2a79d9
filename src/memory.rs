//! Guest-memory access (C2).
//!
//! Two backends share one contract: `/proc/<pid>/mem`, always correct but a
//! syscall round trip per access, and a shim shared-memory fast path when the
//! guest's own address space is directly mapped into this process. Writes
//! are staged and only take effect on an explicit `flush()`; a write handle
//! is tied to the generation it was issued under so it cannot be used again
//! after a flush it didn't participate in (SPEC_FULL.md §4.2).

use crate::errno::{CoreError, GuestErrno};
use std::io::{Read, Seek, SeekFrom, Write};

/// Backend abstraction so `/proc/pid/mem` and a shim-shmem fast path can
/// share one `MemoryAccessor`. Grounded in the teacher's split between
/// ptrace-peek and process_vm_readv paths, generalized to a trait so a
/// shmem-backed implementation can be swapped in without touching callers.
pub trait MemoryBackend {
    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), CoreError>;
    fn write_at(&mut self, addr: u64, buf: &[u8]) -> Result<(), CoreError>;
}

/// `/proc/<pid>/mem`-backed implementation. Always available as long as the
/// tracer has `PTRACE_ATTACH`ed; the fallback when no shmem mapping exists.
pub struct ProcMemBackend {
    pid: i32,
    file: std::fs::File,
}

impl ProcMemBackend {
    pub fn open(pid: i32) -> Result<ProcMemBackend, CoreError> {
        let path = format!("/proc/{}/mem", pid);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| CoreError::ProcMem { pid, source })?;
        Ok(ProcMemBackend { pid, file })
    }
}

impl MemoryBackend for ProcMemBackend {
    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), CoreError> {
        self.file
            .seek(SeekFrom::Start(addr))
            .map_err(|source| CoreError::ProcMem { pid: self.pid, source })?;
        let n = self
            .file
            .read(buf)
            .map_err(|source| CoreError::ProcMem { pid: self.pid, source })?;
        if n != buf.len() {
            return Err(CoreError::ShortTransfer { expected: buf.len(), actual: n });
        }
        Ok(())
    }

    fn write_at(&mut self, addr: u64, buf: &[u8]) -> Result<(), CoreError> {
        self.file
            .seek(SeekFrom::Start(addr))
            .map_err(|source| CoreError::ProcMem { pid: self.pid, source })?;
        let n = self
            .file
            .write(buf)
            .map_err(|source| CoreError::ProcMem { pid: self.pid, source })?;
        if n != buf.len() {
            return Err(CoreError::ShortTransfer { expected: buf.len(), actual: n });
        }
        Ok(())
    }
}

/// The longest C string this crate will read from guest memory before
/// giving up (SPEC_FULL.md §8 edge case: unterminated string).
const MAX_STRING_LEN: usize = 4096;

struct StagedWrite {
    addr: u64,
    bytes: Vec<u8>,
}

/// Cross-address-space accessor for one in-flight syscall. Reads go
/// straight to the backend; writes are buffered in `staged` until
/// `flush()`, so a handler that computes a result piecemeal and then fails
/// partway through never leaves a torn write visible to the guest.
pub struct MemoryAccessor<B: MemoryBackend> {
    backend: B,
    staged: Vec<StagedWrite>,
    generation: u64,
}

/// A token returned by `stage_write` and required for... nothing directly;
/// it exists to prove to the caller (and to `flush`'s invalidation check)
/// that a write happened under a specific generation. Re-borrowed from the
/// accessor on each access rather than held across a `flush()` boundary.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MemoryWriteHandle {
    generation: u64,
}

impl<B: MemoryBackend> MemoryAccessor<B> {
    pub fn new(backend: B) -> MemoryAccessor<B> {
        MemoryAccessor { backend, staged: Vec::new(), generation: 0 }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read `len` bytes from guest address `addr`. Maps a backend failure
    /// to `EFAULT` per §7's guest-read-errno rule.
    pub fn read_ptr(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, GuestErrno> {
        let mut buf = vec![0u8; len];
        self.backend
            .read_at(addr, &mut buf)
            .map_err(|e| e.as_guest_read_errno())?;
        Ok(buf)
    }

    /// Read a NUL-terminated string starting at `addr`, one page-sized
    /// chunk at a time, stopping at the first NUL or `MAX_STRING_LEN`
    /// (§8: ENAMETOOLONG) or a backend failure (§8: EFAULT).
    pub fn read_string(&mut self, addr: u64) -> Result<String, GuestErrno> {
        const CHUNK: usize = 256;
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut buf = vec![0u8; CHUNK];
            self.backend
                .read_at(addr + offset, &mut buf)
                .map_err(|e| e.as_guest_read_errno())?;
            if let Some(nul_pos) = buf.iter().position(|&b| b == 0) {
                out.extend_from_slice(&buf[..nul_pos]);
                return String::from_utf8(out).map_err(|_| GuestErrno::EFAULT);
            }
            out.extend_from_slice(&buf);
            if out.len() > MAX_STRING_LEN {
                return Err(GuestErrno::ENAMETOOLONG);
            }
            offset += CHUNK as u64;
        }
    }

    /// Stage a write at `addr`. Not visible to the guest (or to a
    /// subsequent `read_ptr` against the same address) until `flush()`.
    pub fn stage_write(&mut self, addr: u64, bytes: Vec<u8>) -> MemoryWriteHandle {
        self.staged.push(StagedWrite { addr, bytes });
        MemoryWriteHandle { generation: self.generation }
    }

    /// Returns `true` if `handle` was issued under the generation current
    /// at the time of the call. A handler holding a stale handle across a
    /// `flush()` it didn't cause is a logic error; callers are expected to
    /// `debug_assert!` on this rather than silently no-op.
    pub fn handle_is_current(&self, handle: MemoryWriteHandle) -> bool {
        handle.generation == self.generation
    }

    /// Apply every staged write to the backend, in staging order. On the
    /// first failure, the remaining staged writes are discarded (never
    /// applied) and the generation still advances, so any handle issued
    /// before this flush is unambiguously stale afterward.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        let staged = std::mem::take(&mut self.staged);
        self.generation += 1;
        for write in staged {
            self.backend.write_at(write.addr, &write.bytes)?;
        }
        Ok(())
    }

    /// Discard staged writes without applying them (syscall aborted before
    /// completion). Still advances the generation.
    pub fn discard(&mut self) {
        self.staged.clear();
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeBackend {
        mem: HashMap<u64, u8>,
        fail_write_at: Option<u64>,
    }

    impl FakeBackend {
        fn new() -> FakeBackend {
            FakeBackend { mem: HashMap::new(), fail_write_at: None }
        }
    }

    impl MemoryBackend for FakeBackend {
        fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), CoreError> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *self.mem.get(&(addr + i as u64)).unwrap_or(&0);
            }
            Ok(())
        }

        fn write_at(&mut self, addr: u64, buf: &[u8]) -> Result<(), CoreError> {
            if self.fail_write_at == Some(addr) {
                return Err(CoreError::ShortTransfer { expected: buf.len(), actual: 0 });
            }
            for (i, b) in buf.iter().enumerate() {
                self.mem.insert(addr + i as u64, *b);
            }
            Ok(())
        }
    }

    #[test]
    fn staged_write_invisible_until_flush() {
        let mut acc = MemoryAccessor::new(FakeBackend::new());
        acc.stage_write(100, vec![0xab]);
        let before = acc.read_ptr(100, 1).unwrap();
        assert_eq!(before, vec![0]);
        acc.flush().unwrap();
        let after = acc.read_ptr(100, 1).unwrap();
        assert_eq!(after, vec![0xab]);
    }

    #[test]
    fn write_handle_invalidated_by_flush() {
        let mut acc = MemoryAccessor::new(FakeBackend::new());
        let handle = acc.stage_write(0, vec![1]);
        assert!(acc.handle_is_current(handle));
        acc.flush().unwrap();
        assert!(!acc.handle_is_current(handle));
    }

    #[test]
    fn discard_drops_staged_writes() {
        let mut acc = MemoryAccessor::new(FakeBackend::new());
        acc.stage_write(0, vec![0xff]);
        acc.discard();
        acc.flush().unwrap();
        let read = acc.read_ptr(0, 1).unwrap();
        assert_eq!(read, vec![0]);
    }

    #[test]
    fn read_string_stops_at_nul() {
        let mut backend = FakeBackend::new();
        for (i, b) in b"hi\0garbage".iter().enumerate() {
            backend.mem.insert(i as u64, *b);
        }
        let mut acc = MemoryAccessor::new(backend);
        let s = acc.read_string(0).unwrap();
        assert_eq!(s, "hi");
    }

    #[test]
    fn read_string_without_terminator_hits_name_too_long() {
        let mut backend = FakeBackend::new();
        for i in 0..(MAX_STRING_LEN + 10) {
            backend.mem.insert(i as u64, b'x');
        }
        let mut acc = MemoryAccessor::new(backend);
        let err = acc.read_string(0).unwrap_err();
        assert_eq!(err, GuestErrno::ENAMETOOLONG);
    }

    #[test]
    fn flush_failure_still_advances_generation() {
        let mut backend = FakeBackend::new();
        backend.fail_write_at = Some(0);
        let mut acc = MemoryAccessor::new(backend);
        let handle = acc.stage_write(0, vec![1]);
        assert!(acc.flush().is_err());
        assert!(!acc.handle_is_current(handle));
    }
}
