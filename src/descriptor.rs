//! Descriptor polymorphism (§3.1, §9 "Dynamic dispatch").
//!
//! Real descriptor implementations (regular files, epoll, pipes, sockets)
//! are out of scope (§1); this module defines only the contract C4/C6
//! consume, plus a `TestDescriptor` used by this crate's own tests and
//! suitable as a template for an embedder's real descriptors.

use bitflags::bitflags;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

bitflags! {
    /// Readiness bits a descriptor can report. Mirrors the subset of
    /// `POLLIN`/`POLLOUT`/descriptor-closed state the condition and
    /// select/poll rewriting logic (§4.6) care about.
    pub struct DescriptorStatus: u32 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const CLOSED   = 0b100;
    }
}

/// A subscriber notified when a descriptor's status changes. Implemented
/// by `SyscallCondition`; kept as a trait so descriptors don't need to
/// know about conditions directly.
pub trait StatusListener {
    fn notify(&self, status: DescriptorStatus);
}

/// The polymorphic contract a file-like object must satisfy to
/// participate in syscall conditions (§3.1). Descriptor implementations
/// are owned elsewhere (a process's descriptor table); this crate only
/// ever borrows them for the duration of one dispatch.
pub trait Descriptor {
    /// Current readiness bits.
    fn status(&self) -> DescriptorStatus;

    /// Register to be notified on status changes relevant to `mask`.
    fn subscribe(&self, listener: Weak<dyn StatusListener>, mask: DescriptorStatus);

    /// Remove a previously-registered subscription.
    fn unsubscribe(&self, listener: &Weak<dyn StatusListener>);
}

/// A minimal, manually-triggerable descriptor for tests and as a
/// reference implementation. Not part of the guest-visible syscall
/// surface; only used to exercise C4's trigger-firing logic without a
/// real socket/epoll/pipe backend.
pub struct TestDescriptor {
    status: RefCell<DescriptorStatus>,
    listeners: RefCell<Vec<(Weak<dyn StatusListener>, DescriptorStatus)>>,
}

impl TestDescriptor {
    pub fn new(initial: DescriptorStatus) -> Rc<TestDescriptor> {
        Rc::new(TestDescriptor {
            status: RefCell::new(initial),
            listeners: RefCell::new(Vec::new()),
        })
    }

    /// Change status and notify any subscriber whose mask overlaps the
    /// newly-set bits.
    pub fn set_status(&self, new_status: DescriptorStatus) {
        let added = new_status & !*self.status.borrow();
        *self.status.borrow_mut() = new_status;
        if added.is_empty() {
            return;
        }
        self.listeners.borrow_mut().retain(|(weak, mask)| {
            if let Some(listener) = weak.upgrade() {
                if mask.intersects(added) {
                    listener.notify(new_status);
                }
                true
            } else {
                false
            }
        });
    }
}

impl Descriptor for TestDescriptor {
    fn status(&self) -> DescriptorStatus {
        *self.status.borrow()
    }

    fn subscribe(&self, listener: Weak<dyn StatusListener>, mask: DescriptorStatus) {
        self.listeners.borrow_mut().push((listener, mask));
    }

    fn unsubscribe(&self, listener: &Weak<dyn StatusListener>) {
        self.listeners
            .borrow_mut()
            .retain(|(weak, _)| !weak.ptr_eq(listener));
    }
}
