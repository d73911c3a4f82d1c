//! The arena shared by every process of the server.

use alloc::vec::Vec;
use core::{panic::Location, ptr::NonNull};

use crate::{
    config::Config,
    error::ArenaError,
    heap::{ArenaKind, Heap},
    mutex::{Lock, Locking, SpinLock},
    report::{CallSiteUsage, StatusReport},
    stats::Stats,
};

/// A heap shared by many concurrent workers.
///
/// Every size-class bucket has its own lock `L`, so requests for different
/// classes never wait on each other, and an operation never holds more than one
/// bucket lock at a time. Freed fragments are not merged with their neighbours:
/// they go straight back to their bucket for the next request of that size.
///
/// Size classes listed in [`Config::optimized_sizes`] are fanned out into a
/// ring of secondary buckets. Allocations and frees rotate around the ring, so
/// workers hammering one popular size spread over several locks.
///
/// The `*_unlocked` operations skip every lock. They need `&mut self`, which
/// is only available in single-writer windows such as startup or shutdown.
pub struct SharedArena<'a, L = SpinLock>
where
    L: Lock,
{
    heap: Heap<'a, L>,
}

impl<'a, L> SharedArena<'a, L>
where
    L: Lock + Default,
{
    /// Build a shared arena over `region`.
    pub fn new(region: &'a mut [u8], config: Config) -> Result<Self, ArenaError> {
        let heap = Heap::new("shared", ArenaKind::Shared, region, config)?;
        Ok(SharedArena { heap })
    }
}

impl<'a, L> SharedArena<'a, L>
where
    L: Lock,
{
    /// The arena's name, as used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.heap.name()
    }

    /// Allocate at least `size` bytes.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, ArenaError> {
        self.heap.allocate(size, Locking::Locked, Location::caller())
    }

    /// Return an allocation to its size class. Freeing `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a payload pointer returned by this arena, and no
    /// other worker may free or reallocate it concurrently.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<(), ArenaError> {
        self.heap.free(ptr, Locking::Locked)
    }

    /// Resize an allocation, preserving its contents up to the smaller of the
    /// two sizes.
    ///
    /// Shrinking happens in place. Growing always moves the contents to a new
    /// allocation and frees the old one; if no new allocation can be found the
    /// old one is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`SharedArena::free`].
    #[track_caller]
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>, ArenaError> {
        self.heap.reallocate(ptr, size, Locking::Locked, Location::caller())
    }

    /// [`SharedArena::allocate`] without taking any bucket lock.
    #[track_caller]
    pub fn allocate_unlocked(&mut self, size: usize) -> Result<NonNull<[u8]>, ArenaError> {
        self.heap.allocate(size, Locking::Unlocked, Location::caller())
    }

    /// [`SharedArena::free`] without taking any bucket lock.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a payload pointer returned by this arena.
    pub unsafe fn free_unlocked(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), ArenaError> {
        self.heap.free(ptr, Locking::Unlocked)
    }

    /// [`SharedArena::reallocate`] without taking any bucket lock.
    ///
    /// # Safety
    ///
    /// Same as [`SharedArena::free_unlocked`].
    #[track_caller]
    pub unsafe fn reallocate_unlocked(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>, ArenaError> {
        self.heap.reallocate(ptr, size, Locking::Unlocked, Location::caller())
    }

    /// Pre-split the arena into `count` free fragments of `size` bytes for
    /// every `(size, count)` in `pattern`.
    ///
    /// Meant for startup, so the first workers find their size classes (and
    /// the rings of optimized classes) already populated. If the arena runs
    /// out of memory, everything warmed so far is returned and the error is
    /// reported.
    pub fn warm(&mut self, pattern: &[(usize, usize)]) -> Result<(), ArenaError> {
        let mut warmed = Vec::with_capacity(pattern.iter().map(|(_, count)| count).sum());
        let mut result = Ok(());
        'pattern: for &(size, count) in pattern {
            for _ in 0..count {
                match self
                    .heap
                    .allocate_uncounted(size, Locking::Unlocked, Location::caller())
                {
                    Ok(ptr) => warmed.push(ptr.cast::<u8>()),
                    Err(err) => {
                        result = Err(err);
                        break 'pattern;
                    }
                }
            }
        }

        let fragments = warmed.len();
        for ptr in warmed {
            self.heap.free(Some(ptr), Locking::Unlocked)?;
        }
        log::debug!("{} arena warmed with {fragments} fragments", self.heap.name());
        result
    }

    /// The `n` most requested size classes, as `(size, requests)` pairs sorted
    /// by decreasing request count. Good candidates for
    /// [`Config::optimize_sizes`] on the next start.
    pub fn hot_size_classes(&self, n: usize) -> Vec<(usize, usize)> {
        self.heap.hot_size_classes(n)
    }

    /// Usage counters, if the arena maintains them. Under contention this is
    /// an estimate.
    pub fn stats(&self) -> Option<Stats> {
        self.heap.stats()
    }

    /// Free-list occupancy and totals. Locks one bucket at a time, so it can
    /// run while other workers keep allocating.
    pub fn status_report(&self) -> StatusReport {
        self.heap.status_report()
    }

    /// Like [`SharedArena::status_report`], plus live allocations by call site
    /// when those are tracked.
    pub fn status_report_exclusive(&mut self) -> StatusReport {
        let mut report = self.heap.status_report();
        if self.heap.config().track_call_sites {
            report.call_sites = Some(self.heap.call_site_summary());
        }
        report
    }

    /// Log the bucket-only status report at the configured level.
    pub fn status(&self) {
        self.status_report().log(self.heap.config().status_level);
    }

    /// Live allocations grouped by call site. Empty unless call-site tracking
    /// is enabled.
    pub fn call_site_summary(&mut self) -> Vec<CallSiteUsage> {
        self.heap.call_site_summary()
    }

    /// Walk every fragment and cross-check the free lists and counters.
    pub fn check_integrity(&mut self) -> Result<(), ArenaError> {
        self.heap.check_integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fragment::OVERHEAD, report::FreeCount, size_class};
    use std::{string::ToString, sync::Barrier, thread, vec, vec::Vec};

    const ARENA_SIZE: usize = 64 * 1024;

    fn fill(ptr: NonNull<[u8]>, byte: u8) {
        unsafe { ptr.cast::<u8>().write_bytes(byte, ptr.len()) };
    }

    fn bytes<'b>(ptr: NonNull<[u8]>) -> &'b [u8] {
        unsafe { ptr.as_ref() }
    }

    #[test]
    fn freed_fragments_are_not_merged() {
        let _ = env_logger::try_init();
        let mut region = vec![0; ARENA_SIZE];
        let mut arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();
        let whole = arena.stats().unwrap().free;

        let p = arena.allocate(100).unwrap();
        assert_eq!(p.len(), 112);
        unsafe { arena.free(Some(p.cast())).unwrap() };
        assert_eq!(arena.stats().unwrap().fragments, 2);
        assert_eq!(arena.stats().unwrap().free, whole - OVERHEAD);

        // Without coalescing the arena can no longer hand out its full size.
        assert!(matches!(
            arena.allocate(whole),
            Err(ArenaError::OutOfMemory { arena: "shared", .. })
        ));

        // The freed fragment is reused as is.
        let q = arena.allocate(112).unwrap();
        assert_eq!(q, p);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn double_free_is_detected() {
        let mut region = vec![0; ARENA_SIZE];
        let mut arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();
        let p = arena.allocate(64).unwrap();
        unsafe {
            arena.free(Some(p.cast())).unwrap();
            assert!(matches!(
                arena.free(Some(p.cast())),
                Err(ArenaError::DoubleFree { arena: "shared", .. })
            ));
        }
        arena.check_integrity().unwrap();
    }

    #[test]
    fn reallocate_grows_by_copy_even_next_to_free_space() {
        let mut region = vec![0; ARENA_SIZE];
        let mut arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(64).unwrap();
        fill(p, 0x77);
        let q = unsafe { arena.reallocate(Some(p.cast()), 1024) }.unwrap().unwrap();
        assert_ne!(q.cast::<u8>(), p.cast::<u8>());
        assert_eq!(q.len(), 1024);
        assert!(bytes(q)[..64].iter().all(|b| *b == 0x77));
        assert_eq!(arena.stats().unwrap().used, 1024);

        let r = unsafe { arena.reallocate(Some(q.cast()), 200) }.unwrap().unwrap();
        assert_eq!(r.cast::<u8>(), q.cast::<u8>());
        assert_eq!(r.len(), 208);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn unlocked_variants_match_locked_ones() {
        let mut region = vec![0; ARENA_SIZE];
        let mut arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate_unlocked(500).unwrap();
        assert_eq!(p.len(), 512);
        let q = unsafe { arena.reallocate_unlocked(Some(p.cast()), 2000) }
            .unwrap()
            .unwrap();
        assert_eq!(q.len(), 2000);
        unsafe { arena.free_unlocked(Some(q.cast())).unwrap() };
        unsafe { arena.free_unlocked(None).unwrap() };

        let stats = arena.stats().unwrap();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.fragments, 3);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn optimized_classes_rotate_around_their_ring() {
        let _ = env_logger::try_init();
        let mut region = vec![0; ARENA_SIZE];
        let config = Config::new().optimize_sizes([64], 4);
        let mut arena = SharedArena::<SpinLock>::new(&mut region, config).unwrap();
        let class = size_class::of(64);

        let ptrs: Vec<_> = (0..8).map(|_| arena.allocate(64).unwrap()).collect();
        for p in &ptrs {
            unsafe { arena.free(Some(p.cast())).unwrap() };
        }
        let report = arena.status_report();
        assert_eq!(
            report.class(class).map(|c| c.free.clone()),
            Some(FreeCount::Ring(vec![2, 2, 2, 2]))
        );

        for _ in 0..4 {
            arena.allocate(64).unwrap();
        }
        let report = arena.status_report();
        assert_eq!(
            report.class(class).map(|c| c.free.clone()),
            Some(FreeCount::Ring(vec![1, 1, 1, 1]))
        );
        assert!(report.to_string().contains("|"));
        arena.check_integrity().unwrap();
    }

    #[test]
    fn optimized_classes_are_listed_even_when_empty() {
        let mut region = vec![0; ARENA_SIZE];
        let config = Config::new().optimize_sizes([100, 1 << 20], 3);
        let arena = SharedArena::<SpinLock>::new(&mut region, config).unwrap();
        let report = arena.status_report();
        assert_eq!(
            report.class(size_class::of(112)).map(|c| c.free.clone()),
            Some(FreeCount::Ring(vec![0, 0, 0]))
        );
        // Sizes outside the exact-size range are not optimized.
        assert!(report.class(size_class::of(1 << 20)).is_none());
    }

    #[test]
    fn warming_populates_size_classes() {
        let mut region = vec![0; ARENA_SIZE];
        let config = Config::new().optimize_sizes([32], 2);
        let mut arena = SharedArena::<SpinLock>::new(&mut region, config).unwrap();

        arena.warm(&[(32, 6), (256, 3)]).unwrap();
        let report = arena.status_report();
        assert_eq!(
            report.class(size_class::of(32)).map(|c| c.free.clone()),
            Some(FreeCount::Ring(vec![3, 3]))
        );
        assert_eq!(
            report.class(size_class::of(256)).map(|c| c.free.total()),
            Some(3)
        );
        assert_eq!(arena.stats().unwrap().used, 0);
        // Warming is not a request.
        assert!(arena.hot_size_classes(4).is_empty());
        arena.check_integrity().unwrap();
    }

    #[test]
    fn warming_past_capacity_reports_and_returns_everything() {
        let mut region = vec![0; ARENA_SIZE];
        let mut arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();
        assert!(matches!(
            arena.warm(&[(4096, 100)]),
            Err(ArenaError::OutOfMemory { .. })
        ));
        assert_eq!(arena.stats().unwrap().used, 0);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn hot_size_classes_rank_requests() {
        let mut region = vec![0; ARENA_SIZE];
        let arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();
        for (size, count) in [(64, 5), (120, 3), (32, 1)] {
            for _ in 0..count {
                arena.allocate(size).unwrap();
            }
        }
        assert_eq!(arena.hot_size_classes(2), vec![(64, 5), (128, 3)]);
        assert_eq!(arena.hot_size_classes(10).len(), 3);
    }

    #[test]
    fn hot_size_classes_count_only_served_allocations() {
        let _ = env_logger::try_init();
        let mut region = vec![0; ARENA_SIZE];
        let arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(1024).unwrap();
        let p = unsafe { arena.reallocate(Some(p.cast()), 512) }.unwrap().unwrap();
        let p = unsafe { arena.reallocate(Some(p.cast()), 512) }.unwrap().unwrap();
        assert!(unsafe { arena.reallocate(Some(p.cast()), 0) }.unwrap().is_none());
        assert!(matches!(
            arena.allocate(1 << 30),
            Err(ArenaError::OutOfMemory { .. })
        ));

        assert_eq!(arena.hot_size_classes(10), vec![(1024, 1)]);
    }

    #[test]
    fn growth_by_copy_counts_the_new_size_class() {
        let _ = env_logger::try_init();
        let mut region = vec![0; ARENA_SIZE];
        let mut arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate_unlocked(64).unwrap();
        let p = unsafe { arena.reallocate_unlocked(Some(p.cast()), 256) }
            .unwrap()
            .unwrap();
        unsafe { arena.free_unlocked(Some(p.cast())) }.unwrap();

        let mut hot = arena.hot_size_classes(10);
        hot.sort();
        assert_eq!(hot, vec![(64, 1), (256, 1)]);
    }

    #[test]
    fn status_report_exclusive_includes_call_sites() {
        let mut region = vec![0; ARENA_SIZE];
        let config = Config::new().track_call_sites(true);
        let mut arena = SharedArena::<SpinLock>::new(&mut region, config).unwrap();
        let _p = arena.allocate(48).unwrap();
        let _q = arena.allocate(48).unwrap();

        assert!(arena.status_report().call_sites.is_none());
        let report = arena.status_report_exclusive();
        let sites = report.call_sites.unwrap();
        assert_eq!(sites.len(), 2);
        assert!(sites.iter().all(|s| s.fragments == 1 && s.bytes == 48));
        arena.status();
    }

    #[test]
    fn different_size_classes_do_not_contend() {
        let _ = env_logger::try_init();
        let mut region = vec![0; ARENA_SIZE];
        let arena = SharedArena::<SpinLock>::new(&mut region, Config::default()).unwrap();

        // Leave one free fragment in each of two exact-size classes.
        let small = arena.allocate(32).unwrap();
        let large = arena.allocate(64).unwrap();
        let _wall = arena.allocate(16).unwrap();
        unsafe {
            arena.free(Some(small.cast())).unwrap();
            arena.free(Some(large.cast())).unwrap();
        }

        let held = arena.heap.lock_bucket(size_class::of(32));
        let got = thread::scope(|s| {
            s.spawn(|| arena.allocate(64).map(|p| p.cast::<u8>().as_ptr() as usize))
                .join()
        })
        .unwrap()
        .unwrap();
        assert_eq!(got, large.cast::<u8>().as_ptr() as usize);
        drop(held);

        assert_eq!(arena.allocate(32).unwrap(), small);
    }

    #[test]
    fn concurrent_workers_keep_their_data() {
        let _ = env_logger::try_init();
        const WORKERS: usize = 4;
        const SIZES: [usize; 8] = [16, 48, 100, 256, 512, 1000, 2000, 64];

        let mut region = vec![0; 1 << 20];
        let config = Config::new().optimize_sizes([16, 64], 4);
        let mut arena = SharedArena::<SpinLock>::new(&mut region, config).unwrap();
        let barrier = Barrier::new(WORKERS);

        thread::scope(|s| {
            for worker in 0..WORKERS {
                let arena = &arena;
                let barrier = &barrier;
                s.spawn(move || {
                    let tag = worker as u8 + 1;
                    let mut live = Vec::new();
                    barrier.wait();
                    for i in 0..500 {
                        let p = arena.allocate(SIZES[(i + worker) % SIZES.len()]).unwrap();
                        fill(p, tag);
                        live.push(p);
                        if live.len() > 8 {
                            let p = live.remove(i % live.len());
                            assert!(bytes(p).iter().all(|b| *b == tag));
                            unsafe { arena.free(Some(p.cast())).unwrap() };
                        }
                    }
                    for p in live {
                        assert!(bytes(p).iter().all(|b| *b == tag));
                        unsafe { arena.free(Some(p.cast())).unwrap() };
                    }
                });
            }
        });

        let stats = arena.stats().unwrap();
        assert_eq!(stats.used, 0);
        assert!(stats.max_real_used <= stats.size);
        arena.check_integrity().unwrap();
    }
}
