//! Per-CPU state machine and its bounded FIFO requester queue.
use dlb_pod::Pod;
use dlb_types::Pid;
use vasi::VirtualAddressSpaceIndependent;

/// How many distinct pids may simultaneously wait on one CPU in async mode.
/// Bounded so [`CpuInfo`] keeps a fixed, VASI-safe layout.
pub const MAX_REQUESTERS: usize = 8;

#[derive(Copy, Clone, Eq, PartialEq, Debug, VirtualAddressSpaceIndependent)]
#[repr(u8)]
pub enum CpuState {
    /// No owner; not part of the usable node topology.
    Disabled = 0,
    /// Owner is running on its own CPU.
    Busy = 1,
    /// Owner has lent the CPU out; `guest` may be NOBODY or a borrower.
    Lent = 2,
    /// Owner has asked for the CPU back; waiting for the guest to return it.
    Reclaimed = 3,
}

unsafe impl Pod for CpuState {}

impl Default for CpuState {
    fn default() -> Self {
        CpuState::Disabled
    }
}

/// Fixed-capacity FIFO of distinct pids waiting for a CPU. Used only in
/// async delivery mode; polling callers don't enqueue.
#[derive(Copy, Clone, Default, VirtualAddressSpaceIndependent)]
#[repr(C)]
pub struct RequesterQueue {
    slots: [Pid; MAX_REQUESTERS],
    len: u8,
}

unsafe impl Pod for RequesterQueue {}

impl RequesterQueue {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_REQUESTERS
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.slots[..self.len()].iter().any(|p| *p == pid)
    }

    pub fn front(&self) -> Option<Pid> {
        (self.len() > 0).then_some(self.slots[0])
    }

    /// Enqueues `pid` if it isn't already waiting and there's room.
    /// Returns `false` if the queue was full and `pid` wasn't already in it.
    pub fn push_back_unique(&mut self, pid: Pid) -> bool {
        if self.contains(pid) {
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.slots[self.len()] = pid;
        self.len += 1;
        true
    }

    /// Removes and returns the first waiter, shifting the rest down.
    pub fn pop_front(&mut self) -> Option<Pid> {
        if self.is_empty() {
            return None;
        }
        let front = self.slots[0];
        for i in 1..self.len() {
            self.slots[i - 1] = self.slots[i];
        }
        self.len -= 1;
        Some(front)
    }

    /// Removes `pid` from wherever it sits in the queue, preserving order.
    pub fn remove(&mut self, pid: Pid) -> bool {
        let Some(idx) = self.slots[..self.len()].iter().position(|p| *p == pid) else {
            return false;
        };
        for i in idx..self.len() - 1 {
            self.slots[i] = self.slots[i + 1];
        }
        self.len -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_dedup() {
        let mut q = RequesterQueue::default();
        assert!(q.push_back_unique(Pid::new(1)));
        assert!(q.push_back_unique(Pid::new(2)));
        assert!(q.push_back_unique(Pid::new(1))); // dup is a no-op success
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_front(), Some(Pid::new(1)));
        assert_eq!(q.pop_front(), Some(Pid::new(2)));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn bounded_capacity() {
        let mut q = RequesterQueue::default();
        for i in 1..=MAX_REQUESTERS as i32 {
            assert!(q.push_back_unique(Pid::new(i)));
        }
        assert!(q.is_full());
        assert!(!q.push_back_unique(Pid::new(999)));
    }

    #[test]
    fn remove_from_middle_preserves_order() {
        let mut q = RequesterQueue::default();
        q.push_back_unique(Pid::new(1));
        q.push_back_unique(Pid::new(2));
        q.push_back_unique(Pid::new(3));
        assert!(q.remove(Pid::new(2)));
        assert_eq!(q.pop_front(), Some(Pid::new(1)));
        assert_eq!(q.pop_front(), Some(Pid::new(3)));
    }
}
