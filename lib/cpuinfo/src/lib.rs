//! Per-CPU ownership state machine.
//!
//! A [`CpuInfo`] entry tracks, for one physical CPU, who permanently owns
//! it, who is currently allowed to run on it, and a FIFO of processes
//! waiting their turn. The operations here are pure functions over
//! `&mut [CpuInfo]`; callers (the coordinator, the process-info registry)
//! are responsible for holding the shared-region lock around them.
mod state;

pub use state::{CpuState, RequesterQueue, MAX_REQUESTERS};

use dlb_pod::Pod;
use dlb_types::{CpuMask, ErrorCode, Pid};
use vasi::VirtualAddressSpaceIndependent;

#[derive(Copy, Clone, Default, VirtualAddressSpaceIndependent)]
#[repr(C)]
pub struct CpuInfo {
    owner: Pid,
    guest: Pid,
    state: CpuState,
    requesters: RequesterQueue,
}

unsafe impl Pod for CpuInfo {}

impl CpuInfo {
    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn guest(&self) -> Pid {
        self.guest
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn requesters(&self) -> &RequesterQueue {
        &self.requesters
    }

    pub fn is_disabled(&self) -> bool {
        self.state == CpuState::Disabled
    }
}

/// Enables every CPU in `mask` as owned-and-running by `pid`. CPUs must
/// currently be [`CpuState::Disabled`] (invariant 1: `owner == NOBODY` iff
/// `DISABLED`); any other state means the mask overlaps another owner, or
/// this CPU index, and is a caller bug surfaced as `PERM`.
pub fn register(cpus: &mut [CpuInfo], pid: Pid, mask: &CpuMask) -> Result<(), ErrorCode> {
    for cpu in mask.iter() {
        let Some(info) = cpus.get(cpu) else {
            return Err(ErrorCode::NoEntry);
        };
        if !info.is_disabled() {
            return Err(ErrorCode::PermissionDenied);
        }
    }
    for cpu in mask.iter() {
        let info = &mut cpus[cpu];
        info.owner = pid;
        info.guest = pid;
        info.state = CpuState::Busy;
    }
    Ok(())
}

/// Releases every CPU owned by `pid` back to [`CpuState::Disabled`]. Used on
/// process finalize. Returns the set of CPUs that had an outstanding guest
/// other than the owner (a borrower that was mid-loan when the owner exited)
/// so the caller can decide whether to hand them to the next owner instead
/// of disabling them outright.
pub fn unregister(cpus: &mut [CpuInfo], pid: Pid) -> CpuMask {
    let mut still_guested = CpuMask::empty();
    for (idx, info) in cpus.iter_mut().enumerate() {
        if info.owner != pid {
            continue;
        }
        if info.guest != pid && !info.guest.is_nobody() {
            still_guested.set(idx);
        }
        info.owner = Pid::NOBODY;
        info.guest = Pid::NOBODY;
        info.state = CpuState::Disabled;
        info.requesters = RequesterQueue::default();
    }
    if !still_guested.is_empty() {
        log::debug!("unregistering {pid:?} left {still_guested} guested and disabled");
    }
    still_guested
}

/// Whether a caller that can't be satisfied immediately should be queued for
/// asynchronous delivery, or told to come back and poll again later. Mirrors
/// the reference engine's `--mode=polling|--mode=async` run modes; it is a
/// per-call argument here rather than a global switch so a node could in
/// principle mix both, though in practice every caller on a node agrees on
/// one mode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum QueueMode {
    #[default]
    Polling,
    Async,
}

/// Owner `pid` lends `cpu` out, or (if `pid` is not the owner) withdraws any
/// pending [`acquire_cpu`] request `pid` previously queued on it.
///
/// In the owner case: if a requester is already waiting, the loan is granted
/// to it immediately (FIFO) and its pid is returned as `new_guest`;
/// otherwise the CPU becomes guestless (`new_guest` is [`Pid::NOBODY`]).
/// Either way the call itself reports `Success` — `new_guest` is how the
/// caller learns whether delivery happened.
///
/// In the non-owner case, there is no CPU to lend; this is how a process
/// says "never mind" to an outstanding request instead. It's idempotent —
/// `Success` whether or not `pid` was actually queued, since a process
/// can't always tell whether its earlier request already got a late reply
/// before this call lands.
pub fn lend_cpu(cpus: &mut [CpuInfo], pid: Pid, cpu: usize) -> Result<(ErrorCode, Pid), ErrorCode> {
    let info = cpus.get_mut(cpu).ok_or(ErrorCode::NoEntry)?;
    if info.owner != pid {
        info.requesters.remove(pid);
        return Ok((ErrorCode::Success, Pid::NOBODY));
    }
    if info.state != CpuState::Busy {
        return Err(ErrorCode::PermissionDenied);
    }
    info.state = CpuState::Lent;
    if let Some(next) = info.requesters.pop_front() {
        info.guest = next;
        log::trace!("cpu {cpu} lent by {pid:?}, delivered to queued requester {next:?}");
        Ok((ErrorCode::Success, next))
    } else {
        info.guest = Pid::NOBODY;
        Ok((ErrorCode::Success, Pid::NOBODY))
    }
}

/// Owner `pid` asks for `cpu` back. If nobody else is running on it, the
/// reclaim is immediate (`Success`, `new_guest = pid`, no victim). If a
/// guest is actively using it, the CPU moves to [`CpuState::Reclaimed`] and
/// the guest must call [`return_cpu`]; `Noted` is returned along with the
/// eventual `new_guest` (`pid`, the owner) and the `victim` being preempted.
pub fn reclaim_cpu(
    cpus: &mut [CpuInfo],
    pid: Pid,
    cpu: usize,
) -> Result<(ErrorCode, Pid, Pid), ErrorCode> {
    let info = cpus.get_mut(cpu).ok_or(ErrorCode::NoEntry)?;
    if info.owner != pid {
        return Err(ErrorCode::PermissionDenied);
    }
    match info.state {
        CpuState::Busy => Ok((ErrorCode::NoUpdate, pid, Pid::NOBODY)),
        CpuState::Lent if info.guest.is_nobody() || info.guest == pid => {
            info.guest = pid;
            info.state = CpuState::Busy;
            info.requesters = RequesterQueue::default();
            Ok((ErrorCode::Success, pid, Pid::NOBODY))
        }
        CpuState::Lent => {
            let victim = info.guest;
            info.state = CpuState::Reclaimed;
            Ok((ErrorCode::Noted, pid, victim))
        }
        CpuState::Reclaimed => Ok((ErrorCode::NoUpdate, pid, Pid::NOBODY)),
        CpuState::Disabled => Err(ErrorCode::PermissionDenied),
    }
}

/// `pid` asks to run on a specific lent `cpu`. Succeeds immediately
/// (`Success`, `new_guest = pid`) if the CPU is lent and guestless.
/// Otherwise the outcome depends on `mode`: [`QueueMode::Async`] queues the
/// request (`Noted`, delivered later via [`lend_cpu`] or [`return_cpu`]),
/// unless the queue is full (`NoMemory`); [`QueueMode::Polling`] does not
/// queue anything and reports `NoUpdate` so the caller knows to ask again.
/// `victim` is always [`Pid::NOBODY`]: acquiring never preempts the current
/// guest, unlike [`reclaim_cpu`].
pub fn acquire_cpu(
    cpus: &mut [CpuInfo],
    pid: Pid,
    cpu: usize,
    mode: QueueMode,
) -> Result<(ErrorCode, Pid, Pid), ErrorCode> {
    let info = cpus.get_mut(cpu).ok_or(ErrorCode::NoEntry)?;
    if info.owner == pid {
        return Err(ErrorCode::PermissionDenied);
    }
    match info.state {
        CpuState::Lent if info.guest.is_nobody() => {
            info.guest = pid;
            Ok((ErrorCode::Success, pid, Pid::NOBODY))
        }
        CpuState::Lent | CpuState::Reclaimed | CpuState::Busy => match mode {
            QueueMode::Async => {
                if info.requesters.push_back_unique(pid) {
                    Ok((ErrorCode::Noted, Pid::NOBODY, Pid::NOBODY))
                } else {
                    log::warn!("cpu {cpu} requester queue full, rejecting {pid:?}");
                    Err(ErrorCode::NoMemory)
                }
            }
            QueueMode::Polling => Ok((ErrorCode::NoUpdate, Pid::NOBODY, Pid::NOBODY)),
        },
        CpuState::Disabled => Err(ErrorCode::PermissionDenied),
    }
}

/// `pid` asks to run on any lent, guestless CPU within `candidates`. Returns
/// the CPU index it was granted, or `None` if nothing was immediately
/// available (callers that want to queue should fall back to
/// [`acquire_cpu`] on a specific index).
pub fn borrow_cpu(cpus: &mut [CpuInfo], pid: Pid, candidates: &CpuMask) -> Option<usize> {
    for cpu in candidates.iter() {
        let info = cpus.get_mut(cpu)?;
        if info.state == CpuState::Lent && info.guest.is_nobody() {
            info.guest = pid;
            return Some(cpu);
        }
    }
    None
}

/// Guest `pid` gives back `cpu`. If the owner had reclaimed it, ownership
/// reverts to the owner (`Success`, `new_guest = owner`). If the owner
/// hadn't reclaimed it, the CPU stays lent and is either handed to the next
/// requester (`new_guest` = that requester) or left guestless (`new_guest =
/// NOBODY`); either way the call reports `Success`, matching [`lend_cpu`]'s
/// convention that delivery is reported through `new_guest`, not the error
/// code.
pub fn return_cpu(cpus: &mut [CpuInfo], pid: Pid, cpu: usize) -> Result<(ErrorCode, Pid), ErrorCode> {
    let info = cpus.get_mut(cpu).ok_or(ErrorCode::NoEntry)?;
    if info.guest != pid {
        return Err(ErrorCode::PermissionDenied);
    }
    match info.state {
        CpuState::Reclaimed => {
            info.guest = info.owner;
            info.state = CpuState::Busy;
            Ok((ErrorCode::Success, info.guest))
        }
        CpuState::Lent => {
            if let Some(next) = info.requesters.pop_front() {
                info.guest = next;
                Ok((ErrorCode::Success, next))
            } else {
                info.guest = Pid::NOBODY;
                Ok((ErrorCode::Success, Pid::NOBODY))
            }
        }
        CpuState::Busy | CpuState::Disabled => Err(ErrorCode::PermissionDenied),
    }
}

/// Forcibly reassigns `cpu`'s permanent ownership to `new_owner` (or
/// disables it, if `new_owner` is [`Pid::NOBODY`]), clearing any in-flight
/// loan or request queue on it. Used by the process-info registry when it
/// commits a steal or releases a CPU to the free pool: at that point the
/// CPU structurally belongs to a different process (or no one), so whatever
/// transient lend/acquire relationship it had is moot.
pub fn force_transfer(cpus: &mut [CpuInfo], cpu: usize, new_owner: Pid) -> Result<(), ErrorCode> {
    let info = cpus.get_mut(cpu).ok_or(ErrorCode::NoEntry)?;
    if new_owner.is_nobody() {
        info.owner = Pid::NOBODY;
        info.guest = Pid::NOBODY;
        info.state = CpuState::Disabled;
    } else {
        info.owner = new_owner;
        info.guest = new_owner;
        info.state = CpuState::Busy;
    }
    info.requesters = RequesterQueue::default();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: usize) -> Vec<CpuInfo> {
        vec![CpuInfo::default(); n]
    }

    #[test]
    fn register_then_disabled_invariant() {
        let mut cpus = node(4);
        let p1 = Pid::new(111);
        register(&mut cpus, p1, &CpuMask::from_cpus([0, 1])).unwrap();
        assert_eq!(cpus[0].owner(), p1);
        assert_eq!(cpus[0].state(), CpuState::Busy);
        assert!(cpus[2].is_disabled());
    }

    #[test]
    fn lend_then_acquire_then_return() {
        let mut cpus = node(4);
        let owner = Pid::new(111);
        let guest = Pid::new(222);
        register(&mut cpus, owner, &CpuMask::from_cpus([0])).unwrap();

        assert_eq!(lend_cpu(&mut cpus, owner, 0), Ok((ErrorCode::Success, Pid::NOBODY)));
        assert_eq!(cpus[0].state(), CpuState::Lent);
        assert!(cpus[0].guest().is_nobody());

        assert_eq!(
            acquire_cpu(&mut cpus, guest, 0, QueueMode::Polling),
            Ok((ErrorCode::Success, guest, Pid::NOBODY))
        );
        assert_eq!(cpus[0].guest(), guest);

        assert_eq!(return_cpu(&mut cpus, guest, 0), Ok((ErrorCode::Success, Pid::NOBODY)));
        assert!(cpus[0].guest().is_nobody());
        assert_eq!(cpus[0].state(), CpuState::Lent);
    }

    #[test]
    fn reclaim_while_guested_is_noted_then_returned() {
        let mut cpus = node(4);
        let owner = Pid::new(111);
        let guest = Pid::new(222);
        register(&mut cpus, owner, &CpuMask::from_cpus([0])).unwrap();
        lend_cpu(&mut cpus, owner, 0).unwrap();
        acquire_cpu(&mut cpus, guest, 0, QueueMode::Polling).unwrap();

        assert_eq!(reclaim_cpu(&mut cpus, owner, 0), Ok((ErrorCode::Noted, owner, guest)));
        assert_eq!(cpus[0].state(), CpuState::Reclaimed);

        assert_eq!(return_cpu(&mut cpus, guest, 0), Ok((ErrorCode::Success, owner)));
        assert_eq!(cpus[0].state(), CpuState::Busy);
        assert_eq!(cpus[0].guest(), owner);
    }

    #[test]
    fn fifo_requesters_are_served_in_order() {
        let mut cpus = node(4);
        let owner = Pid::new(111);
        let (a, b) = (Pid::new(2), Pid::new(3));
        register(&mut cpus, owner, &CpuMask::from_cpus([0])).unwrap();
        lend_cpu(&mut cpus, owner, 0).unwrap();
        acquire_cpu(&mut cpus, a, 0, QueueMode::Async).unwrap(); // a gets it immediately
        assert_eq!(
            acquire_cpu(&mut cpus, b, 0, QueueMode::Async),
            Ok((ErrorCode::Noted, Pid::NOBODY, Pid::NOBODY))
        ); // b queues

        assert_eq!(return_cpu(&mut cpus, a, 0), Ok((ErrorCode::Success, b)));
        assert_eq!(cpus[0].guest(), b);
    }

    #[test]
    fn non_owner_cannot_reclaim() {
        let mut cpus = node(4);
        let owner = Pid::new(111);
        let other = Pid::new(222);
        register(&mut cpus, owner, &CpuMask::from_cpus([0])).unwrap();
        assert_eq!(reclaim_cpu(&mut cpus, other, 0), Err(ErrorCode::PermissionDenied));
    }

    #[test]
    fn non_owner_lend_without_a_pending_request_is_a_success_no_op() {
        // Matches the reference engine: a non-owner "lend" is always a
        // withdrawal of its own acquire_cpu request, and it's idempotent —
        // harmless to call even if there was never a request to withdraw,
        // since a late reply could have already resolved it.
        let mut cpus = node(4);
        let owner = Pid::new(111);
        let other = Pid::new(222);
        register(&mut cpus, owner, &CpuMask::from_cpus([0])).unwrap();
        assert_eq!(lend_cpu(&mut cpus, other, 0), Ok((ErrorCode::Success, Pid::NOBODY)));
    }

    #[test]
    fn non_owner_lend_withdraws_a_pending_request() {
        // A process that queued an acquire_cpu request can cancel it by
        // calling lend_cpu on a CPU it doesn't own; this is how the
        // reference engine expresses "never mind" for a noted request.
        let mut cpus = node(4);
        let owner = Pid::new(111);
        let requester = Pid::new(222);
        register(&mut cpus, owner, &CpuMask::from_cpus([0])).unwrap();
        // CPU is Busy, so the request queues rather than resolving.
        assert_eq!(
            acquire_cpu(&mut cpus, requester, 0, QueueMode::Async),
            Ok((ErrorCode::Noted, Pid::NOBODY, Pid::NOBODY))
        );
        assert_eq!(
            lend_cpu(&mut cpus, requester, 0),
            Ok((ErrorCode::Success, Pid::NOBODY))
        );
        assert!(!cpus[0].requesters().contains(requester));
    }

    #[test]
    fn ping_pong_round_trip_polling_mode() {
        // Ports the reference engine's "successful ping-pong" test
        // (polling variant): p1 owns {0,1}, p2 owns {2,3}, p1 wants cpu 3.
        let mut cpus = node(4);
        let p1 = Pid::new(111);
        let p2 = Pid::new(222);
        register(&mut cpus, p1, &CpuMask::from_cpus([0, 1])).unwrap();
        register(&mut cpus, p2, &CpuMask::from_cpus([2, 3])).unwrap();

        assert_eq!(
            acquire_cpu(&mut cpus, p1, 3, QueueMode::Polling),
            Ok((ErrorCode::NoUpdate, Pid::NOBODY, Pid::NOBODY))
        );
        assert_eq!(lend_cpu(&mut cpus, p2, 3), Ok((ErrorCode::Success, Pid::NOBODY)));

        // Polling mode: p1 must ask again.
        assert_eq!(
            acquire_cpu(&mut cpus, p1, 3, QueueMode::Polling),
            Ok((ErrorCode::Success, p1, Pid::NOBODY))
        );

        assert_eq!(reclaim_cpu(&mut cpus, p1, 3), Err(ErrorCode::PermissionDenied));
        assert_eq!(reclaim_cpu(&mut cpus, p2, 3), Ok((ErrorCode::Noted, p2, p1)));
        assert_eq!(cpus[3].state(), CpuState::Reclaimed);

        assert_eq!(return_cpu(&mut cpus, p1, 3), Ok((ErrorCode::Success, p2)));
        assert_eq!(cpus[3].guest(), p2);
        assert_eq!(cpus[3].state(), CpuState::Busy);
    }

    #[test]
    fn ping_pong_round_trip_async_mode() {
        // Same scenario, async variant: the first acquire is NOTED and the
        // subsequent lend delivers cpu 3 straight to p1 without a retry.
        let mut cpus = node(4);
        let p1 = Pid::new(111);
        let p2 = Pid::new(222);
        register(&mut cpus, p1, &CpuMask::from_cpus([0, 1])).unwrap();
        register(&mut cpus, p2, &CpuMask::from_cpus([2, 3])).unwrap();

        assert_eq!(
            acquire_cpu(&mut cpus, p1, 3, QueueMode::Async),
            Ok((ErrorCode::Noted, Pid::NOBODY, Pid::NOBODY))
        );
        assert_eq!(lend_cpu(&mut cpus, p2, 3), Ok((ErrorCode::Success, p1)));
        assert_eq!(cpus[3].guest(), p1);

        assert_eq!(reclaim_cpu(&mut cpus, p2, 3), Ok((ErrorCode::Noted, p2, p1)));
        assert_eq!(return_cpu(&mut cpus, p1, 3), Ok((ErrorCode::Success, p2)));
        assert_eq!(cpus[3].guest(), p2);
    }

    #[test]
    fn late_reply_after_withdrawn_request_polling_mode() {
        // Ports the reference engine's "late reply" scenario: starting from
        // cpu 3 owned and guested by p2 (Busy), p1 polls once (NOUPDT, never
        // queued), then both p1 and p2 "lend" cpu 3 — p1's lend is a no-op
        // withdrawal of a request that was never actually queued, p2's is a
        // real lend — and p2 immediately reclaims it back uncontested.
        let mut cpus = node(4);
        let p1 = Pid::new(111);
        let p2 = Pid::new(222);
        register(&mut cpus, p1, &CpuMask::from_cpus([0, 1])).unwrap();
        register(&mut cpus, p2, &CpuMask::from_cpus([2, 3])).unwrap();

        assert_eq!(
            acquire_cpu(&mut cpus, p1, 3, QueueMode::Polling),
            Ok((ErrorCode::NoUpdate, Pid::NOBODY, Pid::NOBODY))
        );
        assert_eq!(lend_cpu(&mut cpus, p1, 3), Ok((ErrorCode::Success, Pid::NOBODY)));
        assert_eq!(lend_cpu(&mut cpus, p2, 3), Ok((ErrorCode::Success, Pid::NOBODY)));
        assert_eq!(reclaim_cpu(&mut cpus, p2, 3), Ok((ErrorCode::Success, p2, Pid::NOBODY)));
    }

    #[test]
    fn unregister_reports_still_guested_cpus() {
        let mut cpus = node(2);
        let owner = Pid::new(111);
        let guest = Pid::new(222);
        register(&mut cpus, owner, &CpuMask::from_cpus([0, 1])).unwrap();
        lend_cpu(&mut cpus, owner, 0).unwrap();
        acquire_cpu(&mut cpus, guest, 0, QueueMode::Polling).unwrap();

        let still_guested = unregister(&mut cpus, owner);
        assert_eq!(still_guested, CpuMask::from_cpus([0]));
        assert!(cpus[0].is_disabled());
        assert!(cpus[1].is_disabled());
    }
}
