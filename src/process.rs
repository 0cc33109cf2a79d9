//! Process (§3): owns the memory manager, descriptor table, and
//! process-wide signal dispositions; weakly references its threads (actual
//! thread storage lives in the embedder's scheduler, keyed by thread id,
//! per §9's arena-and-index-handle guidance — this crate models only the
//! state a Process exclusively owns).

use crate::descriptor::Descriptor;
use crate::errno::GuestErrno;
use crate::signals::ProcessSignalState;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Fd(pub i32);

/// The guest's open-file-descriptor table. Descriptor implementations
/// themselves (regular files, sockets, epoll) are out of scope (§1); this
/// is only the table mapping a guest fd to one.
#[derive(Default)]
pub struct DescriptorTable {
    entries: HashMap<Fd, Rc<dyn Descriptor>>,
    next_fd: i32,
}

impl DescriptorTable {
    pub fn new() -> DescriptorTable {
        DescriptorTable { entries: HashMap::new(), next_fd: 3 }
    }

    pub fn insert(&mut self, descriptor: Rc<dyn Descriptor>) -> Fd {
        let fd = Fd(self.next_fd);
        self.next_fd += 1;
        self.entries.insert(fd, descriptor);
        fd
    }

    pub fn get(&self, fd: Fd) -> Result<Rc<dyn Descriptor>, GuestErrno> {
        self.entries.get(&fd).cloned().ok_or(GuestErrno::EBADF)
    }

    pub fn remove(&mut self, fd: Fd) -> Result<Rc<dyn Descriptor>, GuestErrno> {
        self.entries.remove(&fd).ok_or(GuestErrno::EBADF)
    }
}

/// A mapped region of the guest's address space, tracked only well enough
/// to answer "is this address range mapped" for `mmap`/`munmap`/`mremap`
/// bookkeeping (full VMA semantics are an OS concern, not re-implemented
/// here).
#[derive(Copy, Clone, Debug)]
pub struct MappedRegion {
    pub start: u64,
    pub len: u64,
}

#[derive(Default)]
pub struct MemoryManager {
    regions: Vec<MappedRegion>,
}

impl MemoryManager {
    pub fn new() -> MemoryManager {
        MemoryManager { regions: Vec::new() }
    }

    pub fn add_region(&mut self, region: MappedRegion) {
        self.regions.push(region);
    }

    pub fn remove_region(&mut self, start: u64, len: u64) {
        self.regions.retain(|r| !(r.start == start && r.len == len));
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.regions.iter().any(|r| addr >= r.start && addr < r.start + r.len)
    }

    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }
}

/// One guest process: native pid, descriptor table, memory manager,
/// process-wide signal dispositions (§3). Threads are owned by the
/// embedder's scheduler and referenced by id, not stored here.
pub struct Process {
    pub native_pid: i32,
    pub descriptors: DescriptorTable,
    pub memory: MemoryManager,
    pub signals: ProcessSignalState,
}

impl Process {
    pub fn new(native_pid: i32) -> Process {
        Process {
            native_pid,
            descriptors: DescriptorTable::new(),
            memory: MemoryManager::new(),
            signals: ProcessSignalState::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorStatus, TestDescriptor};

    #[test]
    fn descriptor_table_allocates_increasing_fds_starting_at_3() {
        let mut table = DescriptorTable::new();
        let a = table.insert(TestDescriptor::new(DescriptorStatus::empty()));
        let b = table.insert(TestDescriptor::new(DescriptorStatus::empty()));
        assert_eq!(a, Fd(3));
        assert_eq!(b, Fd(4));
    }

    #[test]
    fn get_on_missing_fd_is_ebadf() {
        let table = DescriptorTable::new();
        assert_eq!(table.get(Fd(99)).unwrap_err(), GuestErrno::EBADF);
    }

    #[test]
    fn memory_manager_tracks_mapped_ranges() {
        let mut mm = MemoryManager::new();
        mm.add_region(MappedRegion { start: 0x1000, len: 0x1000 });
        assert!(mm.is_mapped(0x1500));
        assert!(!mm.is_mapped(0x500));
        mm.remove_region(0x1000, 0x1000);
        assert!(!mm.is_mapped(0x1500));
    }
}
