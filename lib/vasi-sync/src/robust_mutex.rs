//! A mutex suitable for guarding state that lives in memory shared between
//! independent processes.
//!
//! Ordinary mutexes assume the holder is a thread in the current process and
//! will eventually run again to release the lock. Neither assumption holds
//! for a lock embedded in a POSIX shared memory region: the holder may be a
//! thread in a process that has since crashed, been killed, or exited
//! without unlocking. [`RobustMutex`] adds owner tracking on top of the
//! underlying futex so that a newly arriving locker can detect this
//! situation, forcibly take over the lock, and mark it as requiring
//! consistency recovery before using the data it guards.
use core::{marker::PhantomData, pin::Pin};

use vasi::VirtualAddressSpaceIndependent;

use crate::sync;

#[cfg_attr(not(loom), derive(VirtualAddressSpaceIndependent))]
#[repr(transparent)]
struct AtomicFutexWord(sync::atomic::AtomicU32);

impl AtomicFutexWord {
    // TODO: merge with `new` if and when loom's `AtomicU32` supports a const `new`.
    #[cfg(not(loom))]
    pub const fn const_new(val: FutexWord) -> Self {
        Self(crate::sync::atomic::AtomicU32::new(val.to_u32()))
    }

    pub fn new(val: FutexWord) -> Self {
        Self(crate::sync::atomic::AtomicU32::new(val.to_u32()))
    }

    pub fn inc_sleepers_and_fetch(&self, ord: sync::atomic::Ordering) -> FutexWord {
        // The number of sleepers is stored in the low bits of the futex word,
        // so we can increment the whole word.
        let prev = FutexWord::from(self.0.fetch_add(1, ord));

        // We'll panic here if we've overflowed the "sleepers" half of the word,
        // leaving the lock in a bad state. Since UNLOCKED is 0, this will never
        // cause a spurious unlock, but still-live threads using the lock
        // will likely panic or deadlock.
        FutexWord {
            lock_state: prev.lock_state,
            num_sleepers: prev.num_sleepers.checked_add(1).unwrap(),
        }
    }

    pub fn dec_sleepers_and_fetch(&self, ord: sync::atomic::Ordering) -> FutexWord {
        // Ideally we'd just use an atomic op on the "sleepers" part of the
        // larger word, but that sort of aliasing breaks loom's analysis.
        let prev = FutexWord::from(self.0.fetch_sub(1, ord));

        // We'll panic here if we've underflowed the "sleepers" half of the word,
        // leaving the lock in a bad state. This shouldn't be possible assuming
        // RobustMutex itself isn't buggy.
        FutexWord {
            lock_state: prev.lock_state,
            num_sleepers: prev.num_sleepers.checked_sub(1).unwrap(),
        }
    }

    pub fn unlock_and_fetch(&self, ord: sync::atomic::Ordering) -> FutexWord {
        // We avoid having to synchronize the number of sleepers by using fetch_sub
        // instead of a compare and swap.
        debug_assert_eq!(UNLOCKED, 0);
        let prev = FutexWord::from(self.0.fetch_sub(
            u32::from(FutexWord {
                lock_state: LOCKED,
                num_sleepers: 0,
            }),
            ord,
        ));
        assert_eq!(prev.lock_state, LOCKED);
        FutexWord {
            lock_state: UNLOCKED,
            num_sleepers: prev.num_sleepers,
        }
    }

    pub fn disconnect(&self, ord: sync::atomic::Ordering) {
        let to_add = LOCKED_DISCONNECTED.checked_sub(LOCKED).unwrap();
        let prev = FutexWord::from(self.0.fetch_add(
            u32::from(FutexWord {
                lock_state: to_add,
                num_sleepers: 0,
            }),
            ord,
        ));
        assert_eq!(prev.lock_state, LOCKED);
    }

    /// Forcibly transitions a lock held by a dead owner to `LOCKED`, owned by
    /// us, preserving the sleeper count. Fails (returning the observed word)
    /// if the word changed out from under us, e.g. because the original
    /// owner's unlock raced with our recovery attempt.
    pub fn steal_from_dead_owner(
        &self,
        current: FutexWord,
        success: sync::atomic::Ordering,
        failure: sync::atomic::Ordering,
    ) -> Result<FutexWord, FutexWord> {
        let new = FutexWord {
            lock_state: LOCKED,
            num_sleepers: current.num_sleepers,
        };
        self.compare_exchange(current, new, success, failure)
    }

    pub fn load(&self, ord: sync::atomic::Ordering) -> FutexWord {
        self.0.load(ord).into()
    }

    pub fn compare_exchange(
        &self,
        current: FutexWord,
        new: FutexWord,
        success: sync::atomic::Ordering,
        failure: sync::atomic::Ordering,
    ) -> Result<FutexWord, FutexWord> {
        let raw_res = self
            .0
            .compare_exchange(current.into(), new.into(), success, failure);
        raw_res.map(FutexWord::from).map_err(FutexWord::from)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct FutexWord {
    lock_state: u16,
    num_sleepers: u16,
}

impl FutexWord {
    const fn to_u32(self) -> u32 {
        ((self.lock_state as u32) << 16) | (self.num_sleepers as u32)
    }
}

impl From<u32> for FutexWord {
    fn from(val: u32) -> Self {
        Self {
            lock_state: (val >> 16).try_into().unwrap(),
            num_sleepers: (val & 0xff_ff).try_into().unwrap(),
        }
    }
}

impl From<FutexWord> for u32 {
    fn from(val: FutexWord) -> Self {
        val.to_u32()
    }
}

/// Mutex that is suitable for use in shared memory:
///
/// * It has a fixed layout (`repr(C)`).
/// * It's self-contained: it isn't boxed and doesn't refer to global lock
///   state in this process's address space.
/// * It works across processes (e.g. doesn't use `FUTEX_PRIVATE_FLAG`).
/// * It tracks the pid of its current holder. If a locker finds the mutex
///   held by a pid that no longer exists, it steals the lock and flags it
///   [inconsistent](RobustMutexGuard::is_recovered) rather than deadlocking
///   forever.
///
/// This does not replicate the kernel's robust-futex list (`set_robust_list(2)`):
/// recovery is detected lazily, by the next locker, rather than immediately
/// when the holder dies. Performance is optimized primarily for
/// low-contention scenarios.
#[cfg_attr(not(loom), derive(VirtualAddressSpaceIndependent))]
#[repr(C)]
pub struct RobustMutex<T> {
    futex: AtomicFutexWord,
    owner: sync::atomic::AtomicI32,
    inconsistent: sync::atomic::AtomicU32,
    val: sync::UnsafeCell<T>,
}

unsafe impl<T> Send for RobustMutex<T> where T: Send {}
unsafe impl<T> Sync for RobustMutex<T> where T: Send {}

const UNLOCKED: u16 = 0;
const LOCKED: u16 = 1;
const LOCKED_DISCONNECTED: u16 = 2;

const NO_OWNER: i32 = 0;
const CONSISTENT: u32 = 0;
const INCONSISTENT: u32 = 1;

impl<T> RobustMutex<T> {
    // TODO: merge with `new` when `AtomicFutexWord` supports a const `new`.
    #[cfg(not(loom))]
    pub const fn const_new(val: T) -> Self {
        Self {
            futex: AtomicFutexWord::const_new(FutexWord {
                lock_state: UNLOCKED,
                num_sleepers: 0,
            }),
            owner: sync::atomic::AtomicI32::new(NO_OWNER),
            inconsistent: sync::atomic::AtomicU32::new(CONSISTENT),
            val: sync::UnsafeCell::new(val),
        }
    }

    pub fn new(val: T) -> Self {
        Self {
            futex: AtomicFutexWord::new(FutexWord {
                lock_state: UNLOCKED,
                num_sleepers: 0,
            }),
            owner: sync::atomic::AtomicI32::new(NO_OWNER),
            inconsistent: sync::atomic::AtomicU32::new(CONSISTENT),
            val: sync::UnsafeCell::new(val),
        }
    }

    /// Returns `true` if a previous holder died without releasing the lock
    /// and no one has yet called [`RobustMutexGuard::mark_consistent`] on the
    /// recovered guard.
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(sync::Ordering::Acquire) == INCONSISTENT
    }

    pub fn lock(&self) -> RobustMutexGuard<'_, T> {
        self.lock_with_owner_check(|_pid| true)
    }

    /// Locks the mutex, invoking `owner_is_alive` to check on a contended
    /// lock's holder. Split out from [`RobustMutex::lock`] for testability:
    /// production code uses a real liveness check (`kill(pid, 0)`), tests can
    /// substitute a fake one to deterministically exercise recovery.
    pub fn lock_with_owner_check(
        &self,
        owner_is_alive: impl Fn(i32) -> bool,
    ) -> RobustMutexGuard<'_, T> {
        let mut current = FutexWord {
            lock_state: UNLOCKED,
            num_sleepers: 0,
        };
        let mut recovered = false;
        loop {
            if current.lock_state == UNLOCKED {
                let current_res = self.futex.compare_exchange(
                    current,
                    FutexWord {
                        lock_state: LOCKED,
                        num_sleepers: current.num_sleepers,
                    },
                    sync::Ordering::Acquire,
                    sync::Ordering::Relaxed,
                );
                current = match current_res {
                    Ok(_) => break,
                    Err(i) => i,
                };
            }

            if current.lock_state == UNLOCKED {
                continue;
            }

            // Someone else appears to hold the lock. Before sleeping, check
            // whether they're still alive; if not, steal the lock instead of
            // waiting for a wakeup that will never come.
            let held_by = self.owner.load(sync::Ordering::Acquire);
            if held_by != NO_OWNER && !owner_is_alive(held_by) {
                match self.futex.steal_from_dead_owner(
                    current,
                    sync::Ordering::Acquire,
                    sync::Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.inconsistent
                            .store(INCONSISTENT, sync::Ordering::Release);
                        recovered = true;
                        break;
                    }
                    Err(i) => {
                        current = i;
                        continue;
                    }
                }
            }

            current = self.futex.inc_sleepers_and_fetch(sync::Ordering::Relaxed);
            loop {
                if current.lock_state == UNLOCKED {
                    break;
                }
                match sync::futex_wait(&self.futex.0, current.into()) {
                    Ok(_) | Err(nix::errno::Errno::EINTR) => break,
                    Err(nix::errno::Errno::EAGAIN) => {
                        current = self.futex.load(sync::Ordering::Relaxed)
                    }
                    Err(e) => panic!("Unexpected futex error {e:?}"),
                };
            }
            current = self.futex.dec_sleepers_and_fetch(sync::Ordering::Relaxed);
        }
        self.owner.store(current_pid(), sync::Ordering::Release);
        RobustMutexGuard {
            mutex: Some(self),
            ptr: Some(self.val.get_mut()),
            recovered,
            _phantom: PhantomData,
        }
    }

    pub fn lock_pinned(self: Pin<&Self>) -> Pin<RobustMutexGuard<'_, T>> {
        // SAFETY: `RobustMutexGuard` doesn't provide DerefMut when `T`
        // is `!Unpin`.
        unsafe { Pin::new_unchecked(self.get_ref().lock()) }
    }

    fn unlock(&self) {
        self.owner.store(NO_OWNER, sync::Ordering::Release);
        let current = self.futex.unlock_and_fetch(sync::Ordering::Release);

        if current.num_sleepers > 0 {
            sync::futex_wake(&self.futex.0).unwrap();
        }
    }
}

#[cfg(not(loom))]
fn current_pid() -> i32 {
    rustix::process::getpid().as_raw_nonzero().get()
}
#[cfg(loom)]
fn current_pid() -> i32 {
    // loom models a single process; any fixed nonzero value is fine.
    1
}

pub struct RobustMutexGuard<'a, T> {
    mutex: Option<&'a RobustMutex<T>>,
    ptr: Option<sync::MutPtr<T>>,
    recovered: bool,
    // For purposes of deriving Send, Sync, etc.,
    // this type should act as `&mut T`.
    _phantom: PhantomData<&'a mut T>,
}

impl<'a, T> RobustMutexGuard<'a, T> {
    /// `true` if this lock was stolen from a dead owner. The guarded data may
    /// be left in whatever state the dead holder left it in; the caller is
    /// responsible for inspecting and repairing it, then calling
    /// [`mark_consistent`](Self::mark_consistent).
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Declares the guarded data consistent again after recovering from a
    /// dead owner. A no-op if the mutex wasn't inconsistent.
    pub fn mark_consistent(&mut self) {
        self.recovered = false;
        if let Some(mutex) = self.mutex {
            mutex.inconsistent.store(CONSISTENT, sync::Ordering::Release);
        }
    }

    /// Drops the guard *without releasing the lock*.
    ///
    /// This is useful when a lock must be held across some span of code within
    /// a single thread, but it's difficult to pass the guard between the
    /// two parts of the code.
    pub fn disconnect(mut self) {
        self.mutex
            .unwrap()
            .futex
            .disconnect(sync::Ordering::Relaxed);
        self.mutex.take();
        self.ptr.take();
    }

    /// Reconstitutes a guard that was previously disposed of via `disconnect`.
    ///
    /// Panics if the lock is not disconnected (i.e. if `reconnect` was
    /// already called).
    pub fn reconnect(mutex: &'a RobustMutex<T>) -> Self {
        let mut current = FutexWord {
            lock_state: LOCKED_DISCONNECTED,
            num_sleepers: 0,
        };
        loop {
            assert_eq!(current.lock_state, LOCKED_DISCONNECTED);
            let current_res = mutex.futex.compare_exchange(
                current,
                FutexWord {
                    lock_state: LOCKED,
                    num_sleepers: current.num_sleepers,
                },
                sync::Ordering::Relaxed,
                sync::Ordering::Relaxed,
            );
            match current_res {
                Ok(_) => {
                    mutex.owner.store(current_pid(), sync::Ordering::Release);
                    return Self {
                        mutex: Some(mutex),
                        ptr: Some(mutex.val.get_mut()),
                        recovered: false,
                        _phantom: PhantomData,
                    };
                }
                Err(c) => {
                    current = c;
                }
            }
        }
    }

    /// Map the guard into a function of Pin<&mut T>.
    ///
    /// When T implements `Unpin`, the caller can just use deref_mut instead.
    pub fn map_pinned<F, O>(guard: Pin<Self>, f: F) -> O
    where
        F: FnOnce(Pin<&mut T>) -> O,
    {
        // SAFETY: We ensure that the &mut T made available from the unpinned guard isn't
        // moved-from, by only giving `f` access to a Pin<&mut T>.
        let guard: RobustMutexGuard<T> = unsafe { Pin::into_inner_unchecked(guard) };
        // SAFETY: The pointer is valid because it came from the mutex, which we know is live.
        // The mutex ensures there can be no other live references to the internal data.
        let ref_t = unsafe { guard.ptr.as_ref().unwrap().deref() };
        // SAFETY: We know the original data is pinned, since the guard was Pin<Self>.
        let pinned_t: Pin<&mut T> = unsafe { Pin::new_unchecked(ref_t) };
        f(pinned_t)
    }
}

impl<T> Drop for RobustMutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(mutex) = self.mutex {
            // We have to drop this pointer before unlocking when running
            // under loom, which could otherwise detect multiple mutable
            // references to the underlying cell. Under non loom, the drop
            // has no effect.
            #[allow(clippy::drop_non_drop)]
            drop(self.ptr.take());
            mutex.unlock();
        }
    }
}

impl<T> core::ops::Deref for RobustMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // We can't call self.ptr.as_ref().unwrap().deref() here, since that
        // would create a `&mut T`, and there could already exist a `&T`
        // borrowed from `&self`.
        // https://github.com/tokio-rs/loom/issues/293
        self.ptr.as_ref().unwrap().with(|p| unsafe { &*p })
    }
}

/// When T is Unpin, we can implement DerefMut. Otherwise it's unsafe
/// to do so, since RobustMutex is an Archive type.
impl<T> core::ops::DerefMut for RobustMutexGuard<'_, T>
where
    T: Unpin,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_ref().unwrap().deref() }
    }
}

// For unit/integration tests see tests/scmutex-tests.rs
