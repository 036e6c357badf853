//! Host for a named, versioned POSIX shared-memory region guarded by a
//! single [`RobustMutex`](vasi_sync::robust_mutex::RobustMutex).
//!
//! The region is keyed by a caller-supplied string (salted by uid so two
//! users' keys never collide) and holds a fixed-layout [`RegionHeader`]
//! followed by a mutex-guarded payload of caller-chosen type `T`. The first
//! process to attach creates and zero-initializes the region; later
//! attachers validate the header and map the existing region. Detaching
//! decrements a process-local attach count; the last local detach also
//! unlinks the region's name (best effort — any process still mapped in
//! keeps working, since POSIX shm unlink doesn't invalidate existing
//! mappings).
use std::collections::HashMap;
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::Mutex;

use dlb_pod::Pod;
use dlb_types::ErrorCode;
use rustix::fd::AsFd;
use rustix::fs::{self, Mode, OFlags};
use rustix::mm::{self, MapFlags, ProtFlags};
use vasi::VirtualAddressSpaceIndependent;
use vasi_sync::robust_mutex::{RobustMutex, RobustMutexGuard};

const MAGIC: [u8; 8] = *b"DLBSHMEM";
const VERSION: u32 = 1;

#[derive(Copy, Clone, VirtualAddressSpaceIndependent)]
#[repr(C)]
struct RegionHeader {
    magic: [u8; 8],
    version: u32,
    n_cpus: u32,
    n_procs: u32,
}

unsafe impl Pod for RegionHeader {}

static_assertions::assert_eq_size!(RegionHeader, [u8; 20]);

#[repr(C)]
struct SharedRegion<T> {
    header: RegionHeader,
    mutex: RobustMutex<T>,
}

/// Process-local count of how many times this process has attached each
/// named region. Mirrors the original engine's `subprocesses_attached`: it
/// lives in this process's memory, not the shared region, and exists only
/// so multiple local callers (e.g. re-entrant init) can share one mapping.
/// Keyed by region name so two distinct regions attached concurrently in the
/// same process don't share a count.
static LOCAL_ATTACH_COUNTS: Mutex<Option<HashMap<String, u32>>> = Mutex::new(None);

fn bump_local_attach_count(name: &str, delta: i32) -> u32 {
    let mut guard = LOCAL_ATTACH_COUNTS.lock().unwrap();
    let counts = guard.get_or_insert_with(HashMap::new);
    let count = counts.entry(name.to_owned()).or_insert(0);
    if delta >= 0 {
        *count += delta as u32;
    } else if *count > 0 {
        *count -= 1;
    }
    let new_count = *count;
    if new_count == 0 {
        counts.remove(name);
    }
    new_count
}

/// A local handle on an attached shared region. Dropping it detaches.
pub struct ShmemHost<T> {
    name: CString,
    base: NonNull<SharedRegion<T>>,
    len: usize,
}

// SAFETY: the region is backed by shared memory guarded by a RobustMutex;
// `T: Send` is all that's needed for the handle to cross thread boundaries.
unsafe impl<T: Send> Send for ShmemHost<T> {}
unsafe impl<T: Send> Sync for ShmemHost<T> {}

impl<T: Pod + VirtualAddressSpaceIndependent> ShmemHost<T> {
    /// Attaches to (creating if necessary) the region named by `key`. On
    /// first creation, `init` is called to produce the initial payload.
    pub fn attach(
        key: &str,
        n_cpus: u32,
        n_procs: u32,
        init: impl FnOnce() -> T,
    ) -> Result<Self, ErrorCode> {
        let name = region_name(key);
        let path = CString::new(region_path(&name)).map_err(|_| ErrorCode::NoSharedMemory)?;
        let name = CString::new(name).map_err(|_| ErrorCode::NoSharedMemory)?;

        let len = std::mem::size_of::<SharedRegion<T>>();

        let (fd, created) = match fs::open(
            path.as_c_str(),
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => (fd, true),
            Err(rustix::io::Errno::EXIST) => {
                let fd = fs::open(path.as_c_str(), OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
                    .map_err(|_| ErrorCode::NoSharedMemory)?;
                (fd, false)
            }
            Err(_) => return Err(ErrorCode::NoMemory),
        };

        if created {
            fs::ftruncate(&fd, len as u64).map_err(|_| ErrorCode::NoMemory)?;
        } else {
            let stat = fs::fstat(&fd).map_err(|_| ErrorCode::NoSharedMemory)?;
            if (stat.st_size as usize) < len {
                return Err(ErrorCode::NoSharedMemory);
            }
        }

        // SAFETY: fd is a valid, open file descriptor sized to at least
        // `len` bytes; the mapping is shared so writes are visible to other
        // attachers.
        let addr = unsafe {
            mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(|_| ErrorCode::NoMemory)?;
        drop(fd);

        let base: NonNull<SharedRegion<T>> = NonNull::new(addr as *mut SharedRegion<T>).unwrap();

        if created {
            // SAFETY: we hold the only reference to a freshly-mapped,
            // zero-filled region; no other thread/process can be touching
            // it yet since the name was just created with O_EXCL.
            unsafe {
                let region = base.as_ptr();
                std::ptr::addr_of_mut!((*region).header).write(RegionHeader {
                    magic: MAGIC,
                    version: VERSION,
                    n_cpus,
                    n_procs,
                });
                std::ptr::addr_of_mut!((*region).mutex).write(RobustMutex::new(init()));
            }
        } else {
            // SAFETY: header is Pod and fully written by the creator before
            // any other attacher could observe this path (the file existed).
            let header = unsafe { (*base.as_ptr()).header };
            if header.magic != MAGIC || header.version != VERSION {
                // SAFETY: we never wrote to the mapping; safe to drop it.
                unsafe {
                    let _ = mm::munmap(addr, len);
                }
                return Err(ErrorCode::NoSharedMemory);
            }
            if header.n_cpus != n_cpus || header.n_procs != n_procs {
                unsafe {
                    let _ = mm::munmap(addr, len);
                }
                return Err(ErrorCode::NoSharedMemory);
            }
        }

        bump_local_attach_count(&name.to_string_lossy(), 1);

        if created {
            log::debug!("created shared region {:?} ({n_cpus} cpus, {n_procs} procs)", path);
        } else {
            log::trace!("attached existing shared region {:?}", path);
        }

        Ok(ShmemHost { name, base, len })
    }

    pub fn lock(&self) -> RobustMutexGuard<'_, T> {
        // SAFETY: `base` is a valid mapping for the lifetime of `self`.
        unsafe { &(*self.base.as_ptr()).mutex }.lock()
    }

    pub fn n_cpus(&self) -> u32 {
        unsafe { (*self.base.as_ptr()).header.n_cpus }
    }

    pub fn n_procs(&self) -> u32 {
        unsafe { (*self.base.as_ptr()).header.n_procs }
    }
}

impl<T> Drop for ShmemHost<T> {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in `attach`.
        unsafe {
            let _ = mm::munmap(self.base.as_ptr() as *mut _, self.len);
        }
        let remaining = bump_local_attach_count(&self.name.to_string_lossy(), -1);
        if remaining == 0 {
            // Best effort: other still-mapped processes are unaffected.
            let path = region_path(&self.name.to_string_lossy());
            if let Ok(path) = CString::new(path) {
                if fs::unlink(path.as_c_str()).is_ok() {
                    log::trace!("unlinked shared region {:?} on last local detach", path);
                }
            }
        }
    }
}

fn region_name(key: &str) -> String {
    let uid = rustix::process::getuid().as_raw();
    format!("dlb_{key}_{uid}")
}

fn region_path(name: &str) -> String {
    format!("/dev/shm/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, VirtualAddressSpaceIndependent)]
    #[repr(C)]
    struct Payload {
        counter: u64,
    }
    unsafe impl Pod for Payload {}

    fn unique_key(tag: &str) -> String {
        format!("test_{}_{tag}", std::process::id())
    }

    #[test]
    fn first_attacher_initializes_payload() {
        let key = unique_key("init");
        let host = ShmemHost::attach(&key, 4, 2, || Payload { counter: 42 }).unwrap();
        assert_eq!(host.lock().counter, 42);
        assert_eq!(host.n_cpus(), 4);
        assert_eq!(host.n_procs(), 2);
    }

    #[test]
    fn second_attacher_shares_state() {
        let key = unique_key("share");
        let host1 = ShmemHost::attach(&key, 4, 2, || Payload { counter: 0 }).unwrap();
        host1.lock().counter = 7;
        let host2 = ShmemHost::attach(&key, 4, 2, || Payload { counter: 999 }).unwrap();
        assert_eq!(host2.lock().counter, 7);
    }

    #[test]
    fn distinct_regions_do_not_share_an_attach_count() {
        // Two different regions attached concurrently in this process must
        // each unlink independently: dropping one shouldn't touch the
        // other's refcount.
        let key_a = unique_key("distinct_a");
        let key_b = unique_key("distinct_b");
        let host_a = ShmemHost::attach(&key_a, 4, 2, || Payload { counter: 1 }).unwrap();
        let host_b = ShmemHost::attach(&key_b, 4, 2, || Payload { counter: 2 }).unwrap();
        drop(host_a);
        // host_b's region must still be mapped and readable.
        assert_eq!(host_b.lock().counter, 2);
        let path = region_path(&region_name(&key_b));
        assert!(std::path::Path::new(&path).exists());
        drop(host_b);
        assert!(!std::path::Path::new(&path).exists());
    }
}
