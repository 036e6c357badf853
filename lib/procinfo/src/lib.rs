//! Per-process mask registry.
//!
//! A [`ProcessInfo`] entry is the node-local record of one process's CPU
//! budget: the mask it's actually running on (`current_mask`), the mask it
//! should converge to (`future_mask`), and which of its CPUs were stolen
//! out from under it. Mutating a process's mask is a two-phase handshake:
//! the registry updates `future_mask` and sets `dirty`; the thread-count
//! backend applies the new mask out of band and the process acknowledges by
//! calling [`polldrom`], which copies `future_mask` into `current_mask` and
//! clears `dirty`.
//!
//! As in [`dlb_cpuinfo`], every function here is a pure transformation over
//! borrowed slices; the caller holds the shared-region lock around them.
use dlb_cpuinfo::CpuInfo;
use dlb_pod::Pod;
use dlb_types::{CpuMask, ErrorCode, Pid};
use vasi::VirtualAddressSpaceIndependent;

/// One process's mask bookkeeping.
#[derive(Copy, Clone, Default, VirtualAddressSpaceIndependent)]
#[repr(C)]
pub struct ProcessInfo {
    pid: Pid,
    current_mask: CpuMask,
    future_mask: CpuMask,
    /// CPUs that were stolen away from this process and have not yet been
    /// returned via [`recover_stolen_cpus`].
    stolen_mask: CpuMask,
    dirty: bool,
    returncode: i32,
    /// Running average of CPUs actually used, as reported by the last
    /// `polldrom` cycle. A supplementary statistic, not load-bearing for
    /// the ownership protocol.
    avg_cpu_usage: f64,
    /// Number of CPUs in `current_mask` as of the last `polldrom`
    /// acknowledgment. Also supplementary.
    active_cpus: u32,
}

unsafe impl Pod for ProcessInfo {}

impl ProcessInfo {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_registered(&self) -> bool {
        !self.pid.is_nobody()
    }

    pub fn current_mask(&self) -> CpuMask {
        self.current_mask
    }

    pub fn future_mask(&self) -> CpuMask {
        self.future_mask
    }

    pub fn stolen_mask(&self) -> CpuMask {
        self.stolen_mask
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn returncode(&self) -> i32 {
        self.returncode
    }

    pub fn avg_cpu_usage(&self) -> f64 {
        self.avg_cpu_usage
    }

    pub fn active_cpus(&self) -> u32 {
        self.active_cpus
    }
}

/// Pids of every registered process, in slot order.
pub fn pidlist(procs: &[ProcessInfo]) -> impl Iterator<Item = Pid> + '_ {
    procs.iter().filter(|p| p.is_registered()).map(|p| p.pid)
}

/// Sum of `active_cpus` over every registered process, a coarse node-level
/// utilization figure.
pub fn node_usage(procs: &[ProcessInfo]) -> u32 {
    procs.iter().filter(|p| p.is_registered()).map(|p| p.active_cpus).sum()
}

fn find_mut(procs: &mut [ProcessInfo], pid: Pid) -> Result<&mut ProcessInfo, ErrorCode> {
    procs
        .iter_mut()
        .find(|p| p.pid == pid)
        .ok_or(ErrorCode::NoProcess)
}

fn find(procs: &[ProcessInfo], pid: Pid) -> Result<&ProcessInfo, ErrorCode> {
    procs.iter().find(|p| p.pid == pid).ok_or(ErrorCode::NoProcess)
}

fn find_free_slot(procs: &mut [ProcessInfo]) -> Result<&mut ProcessInfo, ErrorCode> {
    procs
        .iter_mut()
        .find(|p| !p.is_registered())
        .ok_or(ErrorCode::NoMemory)
}

/// Registers `pid` with `requested_mask`, trimming it to whatever is
/// actually free. Returns the mask actually granted, which may be a strict
/// subset of what was requested (never a superset) — the original
/// preregistration-conflict behavior from the reference engine.
pub fn init(
    procs: &mut [ProcessInfo],
    cpus: &mut [CpuInfo],
    free_mask: &mut CpuMask,
    pid: Pid,
    requested_mask: &CpuMask,
) -> Result<CpuMask, ErrorCode> {
    if find(procs, pid).is_ok() {
        return Err(ErrorCode::Request);
    }
    let granted = requested_mask.intersection(free_mask);
    if granted.is_empty() {
        return Err(ErrorCode::PermissionDenied);
    }
    dlb_cpuinfo::register(cpus, pid, &granted)?;
    free_mask.subtract(&granted);

    let slot = find_free_slot(procs)?;
    *slot = ProcessInfo {
        pid,
        current_mask: granted,
        future_mask: granted,
        stolen_mask: CpuMask::empty(),
        dirty: false,
        returncode: 0,
        avg_cpu_usage: 0.0,
        active_cpus: granted.count(),
    };
    Ok(granted)
}

/// Admin-side registration (`ext__preinit`). Identical to [`init`] except it
/// never trims the requested mask against `free_mask` alone: CPUs already
/// owned by someone else are stolen from them instead of silently dropped,
/// via the same steal protocol [`set_new_mask`] uses. When `dry_run` is
/// set, nothing is mutated; the caller uses the returned mask (or error) to
/// decide whether to commit.
pub fn preinit(
    procs: &mut [ProcessInfo],
    cpus: &mut [CpuInfo],
    free_mask: &mut CpuMask,
    pid: Pid,
    requested_mask: &CpuMask,
    dry_run: bool,
) -> Result<CpuMask, ErrorCode> {
    if dry_run {
        let mut procs_copy = procs.to_vec();
        let mut cpus_copy = cpus.to_vec();
        let mut free_copy = *free_mask;
        return preinit(
            &mut procs_copy,
            &mut cpus_copy,
            &mut free_copy,
            pid,
            requested_mask,
            false,
        );
    }
    if find(procs, pid).is_ok() {
        return Err(ErrorCode::Request);
    }
    let slot = find_free_slot(procs)?;
    slot.pid = pid;
    slot.current_mask = CpuMask::empty();
    slot.future_mask = CpuMask::empty();
    slot.stolen_mask = CpuMask::empty();
    slot.dirty = false;
    slot.returncode = 0;

    match set_new_mask(procs, cpus, free_mask, pid, requested_mask, false) {
        Ok(_) => Ok(find(procs, pid)?.future_mask),
        Err(e) => {
            // Roll back the slot reservation; preinit is all-or-nothing.
            if let Ok(slot) = find_mut(procs, pid) {
                *slot = ProcessInfo::default();
            }
            Err(e)
        }
    }
}

/// Releases `pid`'s owned CPUs: `future_mask` if `pid` is dirty (the
/// backend hasn't applied the pending change yet, so `future_mask` is what
/// cpuinfo ownership actually reflects), otherwise `current_mask`.
///
/// If `return_stolen` is set, any of those CPUs that `pid` itself had
/// stolen from another still-registered process are handed straight back
/// to that process (its `future_mask` gains the CPU, `stolen_mask` loses
/// it, and it's marked dirty) instead of going to `free_mask`; a CPU with
/// no such claimant still falls through to `free_mask`. If unset, every
/// released CPU goes to `free_mask` directly, and the original victim (if
/// any) picks it back up later via [`recover_stolen_cpus`].
pub fn finalize(
    procs: &mut [ProcessInfo],
    cpus: &mut [CpuInfo],
    free_mask: &mut CpuMask,
    pid: Pid,
    return_stolen: bool,
) -> Result<(), ErrorCode> {
    let proc = find(procs, pid)?;
    let owned = if proc.dirty { proc.future_mask } else { proc.current_mask };

    let still_guested = dlb_cpuinfo::unregister(cpus, pid);

    if return_stolen {
        for cpu in owned.iter() {
            let victim_idx = procs
                .iter()
                .position(|p| p.is_registered() && p.pid != pid && p.stolen_mask.test(cpu));
            if let Some(victim_idx) = victim_idx {
                let victim = &mut procs[victim_idx];
                victim.stolen_mask.clear(cpu);
                victim.future_mask.set(cpu);
                victim.dirty = true;
                let victim_pid = victim.pid;
                dlb_cpuinfo::force_transfer(cpus, cpu, victim_pid)?;
                log::debug!("finalized {pid:?}, gave cpu {cpu} back to {victim_pid:?}");
            } else {
                free_mask.set(cpu);
            }
        }
    } else {
        free_mask.union_with(&owned);
    }
    // CPUs mid-loan to a borrower when the owner exits go back to the pool
    // too; the borrower's next operation will observe them as reclaimed out
    // from under it.
    free_mask.union_with(&still_guested);

    let slot = find_mut(procs, pid)?;
    *slot = ProcessInfo::default();
    log::debug!("finalized {pid:?}, released {owned} (return_stolen={return_stolen})");
    Ok(())
}

/// Copies `future_mask` into `current_mask` and clears `dirty`, acknowledging
/// that the thread-count backend applied the pending change. A no-op
/// (`NoUpdate`) if the process wasn't dirty.
pub fn polldrom(procs: &mut [ProcessInfo], pid: Pid) -> Result<(CpuMask, ErrorCode), ErrorCode> {
    let proc = find_mut(procs, pid)?;
    if !proc.dirty {
        return Ok((proc.current_mask, ErrorCode::NoUpdate));
    }
    proc.current_mask = proc.future_mask;
    proc.dirty = false;
    proc.returncode = 0;
    proc.active_cpus = proc.current_mask.count();
    Ok((proc.current_mask, ErrorCode::Success))
}

/// Non-blocking mask read. Blocking `SYNC_QUERY` semantics (poll with
/// delay/timeout until not dirty) live in the coordinator, which owns the
/// lock this function assumes is already held.
pub fn getprocessmask(procs: &[ProcessInfo], pid: Pid) -> Result<CpuMask, ErrorCode> {
    Ok(find(procs, pid)?.current_mask)
}

/// Requests a new mask for `pid`. Fails with [`ErrorCode::ProcessDirty`] if
/// the process has an unacknowledged pending change; the caller must
/// `polldrom` first. On success the new mask is recorded in `future_mask`
/// and `dirty` is set so the backend (and the process itself) can converge.
pub fn setprocessmask(
    procs: &mut [ProcessInfo],
    cpus: &mut [CpuInfo],
    free_mask: &mut CpuMask,
    pid: Pid,
    new_mask: &CpuMask,
) -> Result<ErrorCode, ErrorCode> {
    if find(procs, pid)?.dirty {
        return Err(ErrorCode::ProcessDirty);
    }
    set_new_mask(procs, cpus, free_mask, pid, new_mask, false)
}

/// Core mask-transition logic shared by [`preinit`] and [`setprocessmask`]:
/// figures out which CPUs `pid` needs to acquire and which it's giving up,
/// takes free ones directly, and steals the rest.
fn set_new_mask(
    procs: &mut [ProcessInfo],
    cpus: &mut [CpuInfo],
    free_mask: &mut CpuMask,
    pid: Pid,
    new_mask: &CpuMask,
    dry_run: bool,
) -> Result<ErrorCode, ErrorCode> {
    let current = find(procs, pid)?.future_mask;
    if new_mask.is_empty() {
        // Last-CPU protection (invariant 8): a process may never be driven
        // to zero CPUs by an explicit mask change.
        return Err(ErrorCode::PermissionDenied);
    }
    let to_acquire = new_mask.difference(&current);
    let to_free = current.difference(new_mask);

    let from_pool = to_acquire.intersection(free_mask);
    let to_steal = to_acquire.difference(&from_pool);

    if !to_steal.is_empty() && !dry_run {
        steal_mask(procs, cpus, pid, &to_steal)?;
    } else if !to_steal.is_empty() {
        // Dry run: only check feasibility, via a scratch copy.
        let mut procs_copy = procs.to_vec();
        let mut cpus_copy = cpus.to_vec();
        steal_mask(&mut procs_copy, &mut cpus_copy, pid, &to_steal)?;
    }

    if dry_run {
        return Ok(ErrorCode::Success);
    }

    free_mask.subtract(&from_pool);
    free_mask.union_with(&to_free);

    for cpu in from_pool.iter() {
        dlb_cpuinfo::force_transfer(cpus, cpu, pid)?;
    }
    for cpu in to_free.iter() {
        dlb_cpuinfo::force_transfer(cpus, cpu, Pid::NOBODY)?;
    }

    let proc = find_mut(procs, pid)?;
    proc.future_mask = *new_mask;
    proc.dirty = true;
    Ok(ErrorCode::Success)
}

/// Steals every CPU in `to_steal` for `pid`, in the normative deterministic
/// order: highest CPU index first. Victims are considered in process-slot
/// order. All-or-nothing: if any CPU in `to_steal` can't be taken, no
/// partial effect is left (the precondition scan runs fully before any
/// mutation).
fn steal_mask(
    procs: &mut [ProcessInfo],
    cpus: &mut [CpuInfo],
    pid: Pid,
    to_steal: &CpuMask,
) -> Result<(), ErrorCode> {
    let mut cpus_desc: Vec<usize> = to_steal.iter().collect();
    cpus_desc.sort_unstable_by(|a, b| b.cmp(a));

    for cpu in cpus_desc {
        let victim_idx = procs
            .iter()
            .position(|p| p.is_registered() && p.pid != pid && p.future_mask.test(cpu))
            .ok_or(ErrorCode::PermissionDenied)?;
        if procs[victim_idx].future_mask.count() <= 1 {
            // Last-CPU protection on the victim (invariant 8).
            return Err(ErrorCode::PermissionDenied);
        }
    }

    // Preconditions all hold; commit. CpuInfo ownership transfers here too,
    // synchronously, so lend/reclaim authorization checks always see the
    // current owner rather than waiting on the victim's next polldrom.
    for cpu in to_steal.iter() {
        let victim_idx = procs
            .iter()
            .position(|p| p.is_registered() && p.pid != pid && p.future_mask.test(cpu))
            .expect("checked above");
        let victim = &mut procs[victim_idx];
        victim.future_mask.clear(cpu);
        victim.stolen_mask.set(cpu);
        victim.dirty = true;
        dlb_cpuinfo::force_transfer(cpus, cpu, pid)?;
        log::debug!("cpu {cpu} stolen by {pid:?} from {:?}", procs[victim_idx].pid());
    }
    Ok(())
}

/// Returns to `pid` any CPU that was stolen from it and has since become
/// idle again (sitting in `free_mask`). Does nothing for CPUs still in use
/// by whoever stole them.
pub fn recover_stolen_cpus(
    procs: &mut [ProcessInfo],
    cpus: &mut [CpuInfo],
    free_mask: &mut CpuMask,
    pid: Pid,
) -> Result<CpuMask, ErrorCode> {
    let proc = find_mut(procs, pid)?;
    let recoverable = proc.stolen_mask.intersection(free_mask);
    if recoverable.is_empty() {
        return Ok(CpuMask::empty());
    }
    proc.stolen_mask.subtract(&recoverable);
    proc.future_mask.union_with(&recoverable);
    proc.dirty = true;
    free_mask.subtract(&recoverable);
    for cpu in recoverable.iter() {
        dlb_cpuinfo::force_transfer(cpus, cpu, pid)?;
    }
    Ok(recoverable)
}
