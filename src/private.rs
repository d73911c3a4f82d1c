//! The per-process private arena.

use alloc::vec::Vec;
use core::{panic::Location, ptr::NonNull};

use crate::{
    config::Config,
    error::ArenaError,
    heap::{ArenaKind, Heap},
    mutex::{Locking, SingleThreadedLock},
    report::{CallSiteUsage, StatusReport},
    stats::{Stats, UsageMonitor},
};

/// A heap touched by exactly one thread of one process.
///
/// Freed fragments are greedily merged with the free fragments physically
/// following them, and `reallocate` grows in place when the next fragment is
/// free. After every mutation the [`UsageMonitor`] `M` is consulted.
///
/// The arena is not `Sync`; its locks only guard against re-entrance.
pub struct PrivateArena<'a, M = ()>
where
    M: UsageMonitor,
{
    heap: Heap<'a, SingleThreadedLock>,
    monitor: M,
}

impl<'a> PrivateArena<'a> {
    /// Build a private arena over `region`.
    pub fn new(region: &'a mut [u8], config: Config) -> Result<Self, ArenaError> {
        Self::with_monitor(region, config, ())
    }
}

impl<'a, M> PrivateArena<'a, M>
where
    M: UsageMonitor,
{
    /// Build a private arena over `region` that reports its usage to
    /// `monitor` after every mutation.
    pub fn with_monitor(
        region: &'a mut [u8],
        config: Config,
        monitor: M,
    ) -> Result<Self, ArenaError> {
        let heap = Heap::new("private", ArenaKind::Private, region, config)?;
        Ok(PrivateArena { heap, monitor })
    }

    /// The arena's name, as used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.heap.name()
    }

    /// The usage monitor.
    pub fn monitor(&self) -> &M {
        &self.monitor
    }

    fn check_usage(&self) {
        if let Some(stats) = self.heap.stats() {
            self.monitor.check(self.heap.name(), &stats);
        }
    }

    /// Allocate at least `size` bytes.
    ///
    /// The returned payload is granule aligned and its length is `size`
    /// rounded up to the granularity, or more.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, ArenaError> {
        let result = self.heap.allocate(size, Locking::Locked, Location::caller());
        self.check_usage();
        result
    }

    /// Return an allocation to the arena, merging it with any free fragments
    /// that follow it. Freeing `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a payload pointer returned by this arena. A
    /// second free of the same pointer in succession is detected and reported
    /// as [`ArenaError::DoubleFree`], but a pointer whose memory has since been
    /// handed out again cannot be told apart from the new allocation.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<(), ArenaError> {
        let result = self.heap.free(ptr, Locking::Locked);
        self.check_usage();
        result
    }

    /// Resize an allocation, preserving its contents up to the smaller of the
    /// two sizes.
    ///
    /// A `size` of zero frees `ptr` and returns `None`; a `ptr` of `None`
    /// allocates. Shrinking and growth into a free successor happen in place.
    /// Otherwise the contents move to a new allocation; if that fails, the
    /// old one is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`PrivateArena::free`].
    #[track_caller]
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>, ArenaError> {
        let result = self
            .heap
            .reallocate(ptr, size, Locking::Locked, Location::caller());
        self.check_usage();
        result
    }

    /// Usage counters, if the arena maintains them.
    pub fn stats(&self) -> Option<Stats> {
        self.heap.stats()
    }

    /// Live allocations grouped by call site. Empty unless call-site tracking
    /// is enabled.
    pub fn call_site_summary(&self) -> Vec<CallSiteUsage> {
        self.heap.call_site_summary()
    }

    /// Free-list occupancy, totals, and (when tracked) live allocations by
    /// call site.
    pub fn status_report(&self) -> StatusReport {
        let mut report = self.heap.status_report();
        if self.heap.config().track_call_sites {
            report.call_sites = Some(self.heap.call_site_summary());
        }
        report
    }

    /// Log the status report at the configured level.
    pub fn status(&self) {
        self.status_report().log(self.heap.config().status_level);
    }

    /// Walk every fragment and cross-check the free lists and counters.
    pub fn check_integrity(&self) -> Result<(), ArenaError> {
        self.heap.check_integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fragment::OVERHEAD,
        size_class::{self, GRANULARITY},
        stats::LowMemoryWarning,
    };
    use std::{string::ToString, vec, vec::Vec};

    const ARENA_SIZE: usize = 64 * 1024;

    fn region() -> Vec<u8> {
        vec![0; ARENA_SIZE]
    }

    fn fill(ptr: NonNull<[u8]>, byte: u8) {
        unsafe { ptr.cast::<u8>().write_bytes(byte, ptr.len()) };
    }

    fn bytes<'b>(ptr: NonNull<[u8]>) -> &'b [u8] {
        unsafe { ptr.as_ref() }
    }

    /// The payload size of the single fragment spanning a fresh arena.
    fn whole_arena(arena: &PrivateArena<'_, impl UsageMonitor>) -> usize {
        let stats = arena.stats().unwrap();
        stats.free
    }

    #[test]
    fn allocation_rounds_to_granularity() {
        let _ = env_logger::try_init();
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(100).unwrap();
        assert_eq!(p.len(), 112);
        assert_eq!(p.cast::<u8>().as_ptr() as usize % GRANULARITY, 0);

        let stats = arena.stats().unwrap();
        assert_eq!(stats.used, 112);
        assert_eq!(stats.fragments, 2);
        assert!(stats.used <= stats.real_used && stats.real_used <= stats.size);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn free_coalesces_with_following_fragment() {
        let _ = env_logger::try_init();
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();
        let whole = whole_arena(&arena);

        let p = arena.allocate(100).unwrap();
        let remainder = arena.stats().unwrap().free;
        assert_eq!(remainder, whole - 112 - OVERHEAD);

        unsafe { arena.free(Some(p.cast())).unwrap() };
        assert_eq!(arena.stats().unwrap().fragments, 1);
        arena.check_integrity().unwrap();

        // The two pieces were reunited, so the whole arena is available again.
        let all = arena.allocate(whole).unwrap();
        assert_eq!(all.len(), whole);
        assert_eq!(all.cast::<u8>(), p.cast::<u8>());
        unsafe { arena.free(Some(all.cast())).unwrap() };
    }

    #[test]
    fn coalescing_chains_through_several_free_neighbours() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();
        let whole = whole_arena(&arena);

        let ptrs: Vec<_> = (0..4).map(|_| arena.allocate(256).unwrap()).collect();
        for p in ptrs.iter().skip(1).rev() {
            unsafe { arena.free(Some(p.cast())).unwrap() };
        }
        assert_eq!(arena.stats().unwrap().fragments, 2);
        unsafe { arena.free(Some(ptrs[0].cast())).unwrap() };
        assert_eq!(arena.stats().unwrap().fragments, 1);
        assert!(arena.allocate(whole).is_ok());
    }

    #[test]
    fn out_of_memory_is_recoverable() {
        let _ = env_logger::try_init();
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let err = arena.allocate(ARENA_SIZE).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::OutOfMemory {
                arena: "private",
                requested: ARENA_SIZE,
                free: Some(_),
            }
        ));
        assert!(arena.allocate(1024).is_ok());
        arena.check_integrity().unwrap();
    }

    #[test]
    fn out_of_memory_without_statistics() {
        let mut region = region();
        let config = Config::new().maintain_statistics(false);
        let arena = PrivateArena::new(&mut region, config).unwrap();
        assert!(arena.stats().is_none());
        assert!(matches!(
            arena.allocate(ARENA_SIZE * 2).unwrap_err(),
            ArenaError::OutOfMemory { free: None, .. }
        ));
        arena.check_integrity().unwrap();
    }

    #[test]
    fn double_free_is_detected_before_mutation() {
        let _ = env_logger::try_init();
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(64).unwrap();
        let _q = arena.allocate(64).unwrap();
        unsafe { arena.free(Some(p.cast())).unwrap() };
        let before = arena.stats().unwrap();

        let err = unsafe { arena.free(Some(p.cast())) }.unwrap_err();
        assert!(matches!(err, ArenaError::DoubleFree { .. }));
        assert_eq!(arena.stats().unwrap(), before);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn double_free_of_a_merged_fragment_is_detected() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(128).unwrap();
        let q = arena.allocate(128).unwrap();
        let _r = arena.allocate(128).unwrap();
        unsafe {
            arena.free(Some(q.cast())).unwrap();
            // `p` swallows `q`.
            arena.free(Some(p.cast())).unwrap();
            assert!(matches!(
                arena.free(Some(q.cast())),
                Err(ArenaError::DoubleFree { .. })
            ));
        }
        arena.check_integrity().unwrap();
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();
        let before = arena.stats();
        unsafe { arena.free(None).unwrap() };
        assert_eq!(arena.stats(), before);
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();
        let mut elsewhere = [0u8; 64];
        let err = unsafe { arena.free(Some(NonNull::from(&mut elsewhere[0]))) }.unwrap_err();
        assert!(matches!(err, ArenaError::InvalidPointer { .. }));
    }

    #[test]
    fn tiny_regions_are_refused() {
        let mut region = [0u8; 32];
        assert!(matches!(
            PrivateArena::new(&mut region, Config::default()),
            Err(ArenaError::RegionTooSmall { size: 32, .. })
        ));
    }

    #[test]
    fn reallocate_zero_frees_and_null_allocates() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = unsafe { arena.reallocate(None, 40) }.unwrap().unwrap();
        assert_eq!(p.len(), 48);
        assert_eq!(arena.stats().unwrap().used, 48);

        assert!(unsafe { arena.reallocate(Some(p.cast()), 0) }.unwrap().is_none());
        assert_eq!(arena.stats().unwrap().used, 0);
        assert_eq!(arena.stats().unwrap().fragments, 1);
    }

    #[test]
    fn shrink_is_in_place_and_idempotent() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(1024).unwrap();
        fill(p, 0x5a);

        let q = unsafe { arena.reallocate(Some(p.cast()), 300) }.unwrap().unwrap();
        assert_eq!(q.cast::<u8>(), p.cast::<u8>());
        assert_eq!(q.len(), 304);
        assert!(bytes(q).iter().all(|b| *b == 0x5a));

        let r = unsafe { arena.reallocate(Some(q.cast()), 300) }.unwrap().unwrap();
        assert_eq!(r, q);
        assert!(bytes(r).iter().all(|b| *b == 0x5a));
        arena.check_integrity().unwrap();
    }

    #[test]
    fn grow_in_place_into_free_successor() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(256).unwrap();
        fill(p, 0x11);
        let fragments = arena.stats().unwrap().fragments;

        let q = unsafe { arena.reallocate(Some(p.cast()), 4096) }.unwrap().unwrap();
        assert_eq!(q.cast::<u8>(), p.cast::<u8>());
        assert!(q.len() >= 4096);
        assert!(bytes(q)[..256].iter().all(|b| *b == 0x11));
        // One fragment was absorbed and one split off again.
        assert_eq!(arena.stats().unwrap().fragments, fragments);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn grow_by_copy_when_successor_is_busy() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(256).unwrap();
        let _wall = arena.allocate(16).unwrap();
        fill(p, 0x22);

        let q = unsafe { arena.reallocate(Some(p.cast()), 1024) }.unwrap().unwrap();
        assert_ne!(q.cast::<u8>(), p.cast::<u8>());
        assert!(bytes(q)[..256].iter().all(|b| *b == 0x22));
        assert_eq!(arena.stats().unwrap().used, 1024 + 16);
        arena.check_integrity().unwrap();
    }

    #[test]
    fn failed_growth_leaves_the_original_intact() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let p = arena.allocate(256).unwrap();
        let _wall = arena.allocate(16).unwrap();
        fill(p, 0x33);

        assert!(unsafe { arena.reallocate(Some(p.cast()), ARENA_SIZE) }.is_err());
        assert!(bytes(p).iter().all(|b| *b == 0x33));
        unsafe { arena.free(Some(p.cast())).unwrap() };
        arena.check_integrity().unwrap();
    }

    #[test]
    fn high_water_mark_never_decreases() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let mut high = 0;
        let mut live = Vec::new();
        for size in [100, 2000, 30, 9000, 512] {
            live.push(arena.allocate(size).unwrap());
            let stats = arena.stats().unwrap();
            assert!(stats.max_real_used >= high);
            assert!(stats.max_real_used >= stats.real_used);
            high = stats.max_real_used;
        }
        for p in live {
            unsafe { arena.free(Some(p.cast())).unwrap() };
            assert_eq!(arena.stats().unwrap().max_real_used, high);
        }
    }

    #[test]
    fn large_space_tracks_exponential_classes() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();
        let whole = whole_arena(&arena);
        assert_eq!(arena.stats().unwrap().large_space, whole);

        let p = arena.allocate(whole - 1000).unwrap();
        assert_eq!(arena.stats().unwrap().large_space, 0);
        unsafe { arena.free(Some(p.cast())).unwrap() };
        assert_eq!(arena.stats().unwrap().large_space, whole);
    }

    #[test]
    fn call_sites_are_aggregated() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::new().track_call_sites(true)).unwrap();

        let mut live = Vec::new();
        for _ in 0..3 {
            live.push(arena.allocate(32).unwrap());
        }
        let other = arena.allocate(500).unwrap();

        let sites = arena.call_site_summary();
        assert_eq!(sites.len(), 2);
        let counts: Vec<_> = sites.iter().map(|s| (s.fragments, s.bytes)).collect();
        assert!(counts.contains(&(3, 96)));
        assert!(counts.contains(&(1, 512)));
        assert!(sites.iter().all(|s| s.site.file().ends_with("private.rs")));

        unsafe { arena.free(Some(other.cast())).unwrap() };
        assert_eq!(arena.call_site_summary().len(), 1);

        let report = arena.status_report();
        assert_eq!(report.call_sites.as_deref(), Some(&arena.call_site_summary()[..]));
        arena.status();
    }

    #[test]
    fn call_sites_are_not_recorded_by_default() {
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();
        let _p = arena.allocate(32).unwrap();
        assert!(arena.call_site_summary().is_empty());
        assert!(arena.status_report().call_sites.is_none());
    }

    #[test]
    fn status_report_counts_free_fragments() {
        let _ = env_logger::try_init();
        let mut region = region();
        let arena = PrivateArena::new(&mut region, Config::default()).unwrap();

        let a = arena.allocate(112).unwrap();
        let _b = arena.allocate(16).unwrap();
        unsafe { arena.free(Some(a.cast())).unwrap() };

        let report = arena.status_report();
        assert_eq!(report.free_fragments, 2);
        assert_eq!(
            report.class(size_class::of(112)).map(|c| c.free.total()),
            Some(1)
        );
        let text = report.to_string();
        assert!(text.contains("private arena status"));
        assert!(text.contains("TOTAL:      2 free fragments"));
    }

    #[test]
    fn fast_bucket_counts_match_walked_counts() {
        let mut walked_region = region();
        let mut fast_region = region();
        let walked = PrivateArena::new(&mut walked_region, Config::default()).unwrap();
        let config = Config::new().use_fast_bucket_counts(true);
        let fast = PrivateArena::new(&mut fast_region, config).unwrap();

        for arena in [&walked, &fast] {
            let ptrs: Vec<_> = [48, 48, 48, 700, 48]
                .iter()
                .map(|s| arena.allocate(*s).unwrap())
                .collect();
            for i in [0, 2, 3] {
                unsafe { arena.free(Some(ptrs[i].cast())).unwrap() };
            }
        }
        assert_eq!(walked.status_report().classes, fast.status_report().classes);
    }

    #[test]
    fn usage_monitor_sees_every_mutation() {
        let _ = env_logger::try_init();
        let mut region = region();
        let arena =
            PrivateArena::with_monitor(&mut region, Config::default(), LowMemoryWarning::new(50))
                .unwrap();

        let small = arena.allocate(1024).unwrap();
        assert!(!arena.monitor().is_above());
        let big = arena.allocate(ARENA_SIZE / 2).unwrap();
        assert!(arena.monitor().is_above());
        unsafe { arena.free(Some(big.cast())).unwrap() };
        assert!(!arena.monitor().is_above());
        unsafe { arena.free(Some(small.cast())).unwrap() };
    }
}
