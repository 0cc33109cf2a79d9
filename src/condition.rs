//! Syscall conditions (C4): the predicate a blocked thread waits on before
//! it can be resumed. A condition fires for exactly one of three reasons,
//! with a fixed priority when more than one becomes true at once:
//! Signal > DescriptorReady > Timeout (SPEC_FULL.md §4.4).

use crate::descriptor::{Descriptor, DescriptorStatus};
use std::rc::Rc;

/// Why a condition became ready to be re-evaluated.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WakeReason {
    Signal,
    DescriptorReady,
    Timeout,
}

/// The descriptor readiness a condition is waiting for.
#[derive(Clone)]
pub struct Trigger {
    pub descriptor: Rc<dyn Descriptor>,
    pub mask: DescriptorStatus,
}

impl Trigger {
    pub fn new(descriptor: Rc<dyn Descriptor>, mask: DescriptorStatus) -> Trigger {
        Trigger { descriptor, mask }
    }

    fn is_satisfied(&self) -> bool {
        self.descriptor.status().intersects(self.mask)
    }
}

/// A single blocking condition a thread is suspended on. Zero or more
/// `Trigger`s (a descriptor becoming ready), an optional absolute deadline
/// in simulated nanoseconds, and an implicit willingness to wake for any
/// unblocked pending signal (checked by the scheduler, not stored here).
#[derive(Clone)]
pub struct SyscallCondition {
    triggers: Vec<Trigger>,
    deadline_ns: Option<u64>,
    signal_woken: bool,
    restartable: bool,
}

impl SyscallCondition {
    pub fn new(triggers: Vec<Trigger>, deadline_ns: Option<u64>, restartable: bool) -> SyscallCondition {
        SyscallCondition { triggers, deadline_ns, signal_woken: false, restartable }
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        self.deadline_ns
    }

    pub fn restartable(&self) -> bool {
        self.restartable
    }

    /// Mark this condition as having been woken by signal delivery. The
    /// scheduler calls this when it finds an unblocked pending signal for
    /// the owning thread; it takes priority over every other wake reason.
    pub fn wake_for_signal(&mut self) {
        self.signal_woken = true;
    }

    /// Evaluate the condition against the current simulated time. Returns
    /// `None` if nothing has fired yet, otherwise the single reason with
    /// Signal > DescriptorReady > Timeout precedence (SPEC_FULL.md §4.4).
    pub fn poll(&self, now_ns: u64) -> Option<WakeReason> {
        if self.signal_woken {
            return Some(WakeReason::Signal);
        }
        if self.triggers.iter().any(Trigger::is_satisfied) {
            return Some(WakeReason::DescriptorReady);
        }
        if let Some(deadline) = self.deadline_ns {
            if now_ns >= deadline {
                return Some(WakeReason::Timeout);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TestDescriptor;

    #[test]
    fn timeout_fires_once_deadline_passes() {
        let cond = SyscallCondition::new(Vec::new(), Some(1000), true);
        assert_eq!(cond.poll(999), None);
        assert_eq!(cond.poll(1000), Some(WakeReason::Timeout));
    }

    #[test]
    fn descriptor_ready_beats_timeout() {
        let d = TestDescriptor::new(DescriptorStatus::empty());
        let trigger = Trigger::new(d.clone(), DescriptorStatus::READABLE);
        let cond = SyscallCondition::new(vec![trigger], Some(0), true);
        d.set_status(DescriptorStatus::READABLE);
        assert_eq!(cond.poll(0), Some(WakeReason::DescriptorReady));
    }

    #[test]
    fn any_of_several_triggers_firing_wakes_the_condition() {
        let unready = TestDescriptor::new(DescriptorStatus::empty());
        let ready = TestDescriptor::new(DescriptorStatus::WRITABLE);
        let triggers = vec![
            Trigger::new(unready, DescriptorStatus::READABLE),
            Trigger::new(ready, DescriptorStatus::WRITABLE),
        ];
        let cond = SyscallCondition::new(triggers, None, true);
        assert_eq!(cond.poll(0), Some(WakeReason::DescriptorReady));
    }

    #[test]
    fn signal_beats_everything() {
        let d = TestDescriptor::new(DescriptorStatus::READABLE);
        let trigger = Trigger::new(d, DescriptorStatus::READABLE);
        let mut cond = SyscallCondition::new(vec![trigger], Some(0), false);
        cond.wake_for_signal();
        assert_eq!(cond.poll(0), Some(WakeReason::Signal));
    }

    #[test]
    fn no_trigger_and_no_deadline_never_fires() {
        let cond = SyscallCondition::new(Vec::new(), None, true);
        assert_eq!(cond.poll(u64::MAX), None);
    }
}
