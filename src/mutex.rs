//! Provides a mutex container type similar to `std::sync::Mutex<T>` but
//! parameterized over any type `L` that implements the `Lock` trait, so that
//! each free-list bucket can carry its own lock and the lock can live in memory
//! shared between processes.

use core::{
    cell::{Cell, UnsafeCell},
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A trait for providing mutual exclusion.
///
/// If the arena is only ever touched by a single thread (the private, per
/// process heap), you may use [`SingleThreadedLock`], which is the moral
/// equivalent of a `RefCell`. For a heap shared between threads or processes,
/// use [`SpinLock`] or your own implementation backed by whatever primitive
/// your runtime provides.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then an arena using this locking
///   mechanism will be `Sync`, and therefore this method must provide actual
///   mutual exclusion and prevent against unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent recursive locking and re-entering the
///   lock when it is already held. The prevention may be a panic, abort,
///   infinite loop, or etc...
pub unsafe trait Lock {
    /// Lock this mutex.
    ///
    /// If it is already locked, this must result in a panic, abort, infinite
    /// loop, or etc... and locking must not succeed.
    fn lock(&self);

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// This is effectively a `RefCell`. It is the lock used by
/// [`PrivateArena`](crate::PrivateArena), and because it is not `Sync` it
/// keeps that arena confined to one thread.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get());
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A test-and-test-and-set spin lock.
///
/// The whole lock state is a single atomic flag stored inline, so it works
/// equally well between threads and between processes that map the same
/// memory. Re-entering a held lock spins forever.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }
}

/// How a bucket's free list is reached: through its lock, or directly because
/// the caller holds the whole arena exclusively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Locking {
    Locked,
    /// Only valid while the caller has `&mut` access to the arena.
    Unlocked,
}

#[derive(Default)]
pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another thread
// and getting a mutex guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(crate) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard {
            mutex: self,
            locked: true,
        }
    }

    /// Get at the value either through the lock or, for `Locking::Unlocked`,
    /// without touching it.
    ///
    /// # Safety
    ///
    /// With `Locking::Unlocked` the caller must have exclusive access to every
    /// mutex that could be reached concurrently, and must not hold another
    /// guard to this same mutex.
    pub(crate) unsafe fn acquire(&self, locking: Locking) -> MutexGuard<'_, T, L> {
        match locking {
            Locking::Locked => self.lock(),
            Locking::Unlocked => MutexGuard {
                mutex: self,
                locked: false,
            },
        }
    }
}

pub(crate) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
    locked: bool,
}

impl<'a, T, L> Drop for MutexGuard<'a, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        if self.locked {
            self.mutex.lock.unlock();
        }
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}
