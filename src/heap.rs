//! The allocation engine shared by both arena flavors.
//!
//! The heap is a contiguous region tiled by fragments (see [`crate::fragment`]).
//! Free fragments are kept in a table of buckets indexed by size class. Every
//! bucket owns its own lock, so requests for different size classes never
//! contend. Hot classes may additionally be fanned out into a ring of
//! secondary buckets that are served round-robin.
//!
//! Locking discipline:
//!
//! * At most one bucket lock is held at any time. A fragment detached from a
//!   free list is owned exclusively by the detaching caller, so splitting it
//!   and filing the remainder needs only the remainder's bucket lock.
//!
//! * The allocation scan moves upwards through the size classes, releasing each
//!   bucket before trying the next one.
//!
//! * `Locking::Unlocked` skips the bucket locks altogether and is only passed
//!   down from entry points holding `&mut` access to the arena.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::{
    marker::PhantomData,
    panic::Location,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    config::Config,
    error::ArenaError,
    fragment::{FragmentState, Header, OVERHEAD},
    mutex::{Lock, Locking, Mutex, MutexGuard},
    report::{CallSiteUsage, ClassReport, FreeCount, StatusReport},
    size_class::{self, GRANULARITY, LINEAR_LIMIT, NUM_SIZE_CLASSES},
    stats::{Counters, Stats},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArenaKind {
    /// One process, forward coalescing on free, in-place realloc growth.
    Private,
    /// Many processes, no coalescing, optional sub-bucket rings.
    Shared,
}

#[derive(Default)]
pub(crate) struct FreeList {
    head: Option<usize>,
}

/// The ring of secondary buckets serving one optimized size class.
struct Ring {
    first: usize,
    len: usize,
    /// Where the next allocation starts scanning.
    get: AtomicUsize,
    /// Where the next freed fragment goes.
    put: AtomicUsize,
}

impl Ring {
    fn buckets(&self) -> core::ops::Range<usize> {
        self.first..self.first + self.len
    }

    fn next_put(&self) -> usize {
        self.first + self.put.fetch_add(1, Ordering::Relaxed) % self.len
    }
}

struct Bucket<L> {
    free: Mutex<FreeList, L>,
    /// The size class this bucket (or the ring it belongs to) serves.
    class: usize,
    /// Approximate fragment count, only maintained with fast bucket counts.
    approx_len: AtomicUsize,
    ring: Option<Ring>,
}

impl<L> Bucket<L>
where
    L: Lock + Default,
{
    fn new(class: usize) -> Self {
        Bucket {
            free: Mutex::new(FreeList::default(), L::default()),
            class,
            approx_len: AtomicUsize::new(0),
            ring: None,
        }
    }
}

pub(crate) struct Heap<'a, L>
where
    L: Lock,
{
    name: &'static str,
    kind: ArenaKind,
    /// Start of the first fragment, aligned to the granularity.
    base: NonNull<u8>,
    /// Offset of the end sentinel: one past the last fragment.
    end: usize,
    /// Size of the region we were handed, slack included.
    size: usize,
    config: Config,
    buckets: Box<[Bucket<L>]>,
    counters: Counters,
    large_space: AtomicUsize,
    /// Requests per starting size class. Racy by intent.
    class_usage: Box<[AtomicUsize]>,
    _region: PhantomData<&'a mut [u8]>,
}

// Safety: the heap owns its region for `'a`; all shared mutation of headers
// goes through atomics and of free lists through the bucket mutexes.
unsafe impl<L> Send for Heap<'_, L> where L: Lock + Send {}

// Safety: as above, with the `Lock` contract providing mutual exclusion for
// the free lists.
unsafe impl<L> Sync for Heap<'_, L> where L: Lock + Sync {}

impl<'a, L> Heap<'a, L>
where
    L: Lock + Default,
{
    /// Carve `region` into a heap holding one free fragment that spans all of
    /// it.
    pub(crate) fn new(
        name: &'static str,
        kind: ArenaKind,
        region: &'a mut [u8],
        config: Config,
    ) -> Result<Self, ArenaError> {
        let size = region.len();
        let minimum = OVERHEAD + 2 * GRANULARITY - 1;
        let slack = region.as_mut_ptr().align_offset(GRANULARITY);
        let end = size
            .checked_sub(slack)
            .map(|usable| usable & !(GRANULARITY - 1))
            .filter(|usable| *usable >= OVERHEAD + GRANULARITY)
            .ok_or(ArenaError::RegionTooSmall { size, minimum })?;
        let base = NonNull::from(&mut region[slack..]).cast::<u8>();

        let mut buckets: Vec<Bucket<L>> = (0..NUM_SIZE_CLASSES).map(Bucket::new).collect();
        if kind == ArenaKind::Shared {
            Self::build_rings(&mut buckets, &config);
        }

        let class_usage = (0..NUM_SIZE_CLASSES).map(|_| AtomicUsize::new(0)).collect();

        // Safety: `base` is granule aligned and the region has room for at
        // least one header plus one granule.
        unsafe {
            base.cast::<Header>().write(Header::new(end - OVERHEAD));
        }

        let heap = Heap {
            name,
            kind,
            base,
            end,
            size,
            config,
            buckets: buckets.into_boxed_slice(),
            counters: Counters::new(size),
            large_space: AtomicUsize::new(0),
            class_usage,
            _region: PhantomData,
        };
        heap.release(0, Locking::Locked);
        heap.account(Counters::update_high_water);

        log::debug!(
            "{} arena initialized: {} bytes, {} buckets, first fragment of {} bytes",
            heap.name,
            size,
            heap.buckets.len(),
            end - OVERHEAD
        );
        Ok(heap)
    }

    fn build_rings(buckets: &mut Vec<Bucket<L>>, config: &Config) {
        if config.optimized_sizes.is_empty() {
            return;
        }
        if config.secondary_ring_size == 0 {
            log::warn!("secondary ring size is zero, not optimizing any size class");
            return;
        }

        for &size in &config.optimized_sizes {
            let class = match size_class::round_up(size) {
                Some(rounded) if rounded <= LINEAR_LIMIT => size_class::of(rounded),
                _ => {
                    log::warn!("cannot optimize size {size}: outside the exact-size classes");
                    continue;
                }
            };
            if buckets[class].ring.is_some() {
                continue;
            }

            let first = buckets.len();
            buckets.extend((0..config.secondary_ring_size).map(|_| Bucket::new(class)));
            buckets[class].ring = Some(Ring {
                first,
                len: config.secondary_ring_size,
                get: AtomicUsize::new(0),
                put: AtomicUsize::new(0),
            });
        }
    }
}

impl<'a, L> Heap<'a, L>
where
    L: Lock,
{
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    fn header(&self, offset: usize) -> &Header {
        debug_assert!(offset % GRANULARITY == 0);
        debug_assert!(offset + OVERHEAD <= self.end);
        // Safety: fragment offsets are granule aligned and within the region,
        // and a header has been written at every fragment boundary.
        unsafe { &*self.base.as_ptr().add(offset).cast::<Header>() }
    }

    #[inline]
    fn is_fragment_offset(&self, offset: usize) -> bool {
        offset % GRANULARITY == 0 && offset < self.end && self.end - offset >= OVERHEAD
    }

    #[inline]
    fn list(&self, bucket: usize, locking: Locking) -> MutexGuard<'_, FreeList, L> {
        // Safety: `Locking::Unlocked` only comes from `&mut self` entry points,
        // and no caller holds two guards to the same bucket.
        unsafe { self.buckets[bucket].free.acquire(locking) }
    }

    #[inline]
    fn counters(&self) -> Option<&Counters> {
        self.config.maintain_statistics.then_some(&self.counters)
    }

    #[inline]
    fn account(&self, f: impl FnOnce(&Counters)) {
        if let Some(counters) = self.counters() {
            f(counters);
        }
    }

    /// The payload of the fragment at `offset`.
    fn payload(&self, offset: usize) -> NonNull<[u8]> {
        let size = self.header(offset).size();
        // Safety: the payload follows the header within the region.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset + OVERHEAD)) };
        NonNull::slice_from_raw_parts(ptr, size)
    }

    /// The fragment physically following `offset`, bounded by the end
    /// sentinel. A size that would run past the end stops the walk.
    pub(crate) fn next_fragment(&self, offset: usize) -> Option<usize> {
        let next = offset
            .checked_add(OVERHEAD)?
            .checked_add(self.header(offset).size())?;
        self.is_fragment_offset(next).then_some(next)
    }

    fn fragment_of(&self, ptr: NonNull<u8>) -> Result<usize, ArenaError> {
        let address = ptr.as_ptr() as usize;
        (address)
            .checked_sub(self.base.as_ptr() as usize + OVERHEAD)
            .filter(|offset| self.is_fragment_offset(*offset))
            .ok_or_else(|| {
                let err = ArenaError::InvalidPointer {
                    arena: self.name,
                    address,
                };
                log::error!("{err}");
                err
            })
    }

    /// Map a pointer to its fragment, refusing fragments that are already
    /// free before anything is mutated.
    fn allocated_fragment(&self, ptr: NonNull<u8>) -> Result<usize, ArenaError> {
        let offset = self.fragment_of(ptr)?;
        if self.header(offset).is_free() {
            let err = ArenaError::DoubleFree {
                arena: self.name,
                offset,
            };
            log::error!("{err}");
            return Err(err);
        }
        Ok(offset)
    }

    fn out_of_memory(&self, requested: usize) -> ArenaError {
        let err = ArenaError::OutOfMemory {
            arena: self.name,
            requested,
            free: self.counters().map(|c| c.free(self.size)),
        };
        log::error!("{err}");
        err
    }

    fn corrupted(&self, offset: usize, reason: &'static str) -> ArenaError {
        let err = ArenaError::Corrupted {
            arena: self.name,
            offset,
            reason,
        };
        log::error!("{err}");
        err
    }

    /// The bucket a free fragment of `size` bytes should be filed under.
    fn insert_bucket(&self, size: usize) -> usize {
        let class = size_class::of(size);
        match &self.buckets[class].ring {
            Some(ring) => ring.next_put(),
            None => class,
        }
    }

    /// Push the fragment at `offset` onto `list`, which is bucket `bucket`'s
    /// locked free list.
    fn attach(&self, bucket: usize, list: &mut FreeList, offset: usize) {
        let header = self.header(offset);
        let size = header.size();

        header.mark_free(bucket, list.head);
        if let Some(head) = list.head {
            self.header(head).set_prev(Some(offset));
        }
        list.head = Some(offset);

        if self.config.use_fast_bucket_counts {
            self.buckets[bucket].approx_len.fetch_add(1, Ordering::Relaxed);
        }
        if size > LINEAR_LIMIT {
            self.large_space.fetch_add(size, Ordering::Relaxed);
        }
        self.account(|c| c.attached(size));
    }

    /// Unlink the fragment at `offset` from `list`, which is bucket
    /// `bucket`'s locked free list.
    fn detach(&self, bucket: usize, list: &mut FreeList, offset: usize) {
        let header = self.header(offset);
        let size = header.size();
        let (next, prev) = (header.next(), header.prev());

        match prev {
            Some(prev) => self.header(prev).set_next(next),
            None => list.head = next,
        }
        if let Some(next) = next {
            self.header(next).set_prev(prev);
        }
        header.mark_allocated();

        if self.config.use_fast_bucket_counts {
            self.buckets[bucket].approx_len.fetch_sub(1, Ordering::Relaxed);
        }
        if size > LINEAR_LIMIT {
            self.large_space.fetch_sub(size, Ordering::Relaxed);
        }
        self.account(|c| c.detached(size));
    }

    /// File the (detached) fragment at `offset` under the bucket for its size.
    pub(crate) fn release(&self, offset: usize, locking: Locking) {
        let bucket = self.insert_bucket(self.header(offset).size());
        let mut list = self.list(bucket, locking);
        self.attach(bucket, &mut list, offset);
    }

    /// First fit within one bucket.
    fn take_first_fit(&self, bucket: usize, size: usize, locking: Locking) -> Option<usize> {
        let mut list = self.list(bucket, locking);
        let mut cursor = list.head;
        while let Some(offset) = cursor {
            let header = self.header(offset);
            if header.size() >= size {
                self.detach(bucket, &mut list, offset);
                return Some(offset);
            }
            cursor = header.next();
        }
        None
    }

    /// Walk the size classes upwards from `class` and detach the first
    /// fragment of at least `size` bytes.
    fn find_and_detach(&self, class: usize, size: usize, locking: Locking) -> Option<usize> {
        for class in class..NUM_SIZE_CLASSES {
            match &self.buckets[class].ring {
                None => {
                    if let Some(offset) = self.take_first_fit(class, size, locking) {
                        return Some(offset);
                    }
                }
                Some(ring) => {
                    let start = ring.get.load(Ordering::Relaxed);
                    for i in 0..ring.len {
                        let bucket = ring.first + (start + i) % ring.len;
                        if let Some(offset) = self.take_first_fit(bucket, size, locking) {
                            // Serve the ring round-robin.
                            ring.get
                                .store((start + i + 1) % ring.len, Ordering::Relaxed);
                            return Some(offset);
                        }
                    }
                }
            }
        }
        None
    }

    /// Serve a request, counting it against its starting size class in a
    /// shared heap.
    pub(crate) fn allocate(
        &self,
        size: usize,
        locking: Locking,
        site: &'static Location<'static>,
    ) -> Result<NonNull<[u8]>, ArenaError> {
        self.allocate_counted(size, locking, site, self.kind == ArenaKind::Shared)
    }

    /// Serve a request without counting it as demand for its size class.
    pub(crate) fn allocate_uncounted(
        &self,
        size: usize,
        locking: Locking,
        site: &'static Location<'static>,
    ) -> Result<NonNull<[u8]>, ArenaError> {
        self.allocate_counted(size, locking, site, false)
    }

    fn allocate_counted(
        &self,
        size: usize,
        locking: Locking,
        site: &'static Location<'static>,
        counted: bool,
    ) -> Result<NonNull<[u8]>, ArenaError> {
        let size = size_class::round_up(size).ok_or_else(|| self.out_of_memory(size))?;
        let class = size_class::of(size);
        let offset = self
            .find_and_detach(class, size, locking)
            .ok_or_else(|| self.out_of_memory(size))?;
        if counted {
            self.class_usage[class].fetch_add(1, Ordering::Relaxed);
        }

        let header = self.header(offset);
        self.account(|c| c.grow_used(header.size()));
        self.split(offset, size, locking);
        header.set_site(self.config.track_call_sites.then_some(site));
        self.account(Counters::update_high_water);

        Ok(self.payload(offset))
    }

    /// Trim the allocated fragment at `offset` down to `size` bytes, filing
    /// the remainder as a new free fragment, if the remainder is worth it.
    fn split(&self, offset: usize, size: usize, locking: Locking) {
        let header = self.header(offset);
        let fragment_size = header.size();
        if !size_class::can_split(fragment_size, size) {
            return;
        }

        header.set_size(size);
        let rest = offset + OVERHEAD + size;
        // Safety: `rest` is granule aligned and lies within the payload of a
        // fragment nobody else can reach.
        unsafe {
            self.base
                .as_ptr()
                .add(rest)
                .cast::<Header>()
                .write(Header::new(fragment_size - size - OVERHEAD));
        }
        self.account(|c| {
            c.shrink_used(fragment_size - size);
            c.split();
        });

        self.release(rest, locking);
    }

    /// Merge the free fragment at `next` into the fragment at `offset`.
    ///
    /// Returns `false`, leaving both untouched, if `next` is not free or its
    /// recorded size runs past the end of the arena.
    fn absorb(&self, offset: usize, next: usize, locking: Locking) -> bool {
        let FragmentState::Free { bucket, .. } = self.header(next).state() else {
            return false;
        };
        let extent = self
            .header(next)
            .size()
            .checked_add(OVERHEAD)
            .and_then(|s| next.checked_add(s));
        if extent.map_or(true, |end| end > self.end) {
            self.corrupted(next, "free neighbour overruns the arena end");
            return false;
        }
        {
            let mut list = self.list(bucket, locking);
            if !self.header(next).is_free() {
                return false;
            }
            self.detach(bucket, &mut list, next);
        }

        let absorbed = self.header(next);
        absorbed.retire();
        let header = self.header(offset);
        header.set_size(header.size() + OVERHEAD + absorbed.size());
        self.account(Counters::merged);
        true
    }

    pub(crate) fn free(
        &self,
        ptr: Option<NonNull<u8>>,
        locking: Locking,
    ) -> Result<(), ArenaError> {
        let Some(ptr) = ptr else {
            log::debug!("free(0) called on the {} arena", self.name);
            return Ok(());
        };
        let offset = self.allocated_fragment(ptr)?;
        self.account(|c| c.shrink_used(self.header(offset).size()));

        if self.kind == ArenaKind::Private {
            // Coalesce forwards only: there are no back pointers to follow.
            while let Some(next) = self.next_fragment(offset) {
                if !self.absorb(offset, next, locking) {
                    break;
                }
            }
        }

        self.release(offset, locking);
        Ok(())
    }

    /// Grow the fragment at `offset` to `size` bytes by swallowing its free
    /// physical successor, if that is large enough.
    fn grow_in_place(&self, offset: usize, size: usize, locking: Locking) -> bool {
        let header = self.header(offset);
        let original = header.size();
        let Some(next) = self.next_fragment(offset) else {
            return false;
        };
        let next_header = self.header(next);
        let available = original
            .saturating_add(OVERHEAD)
            .saturating_add(next_header.size());
        if !next_header.is_free() || available < size {
            return false;
        }
        if !self.absorb(offset, next, locking) {
            return false;
        }

        self.account(|c| c.grow_used(header.size() - original));
        self.split(offset, size, locking);
        self.account(Counters::update_high_water);
        true
    }

    pub(crate) fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        locking: Locking,
        site: &'static Location<'static>,
    ) -> Result<Option<NonNull<[u8]>>, ArenaError> {
        if size == 0 {
            self.free(ptr, locking)?;
            return Ok(None);
        }
        let Some(ptr) = ptr else {
            return self.allocate(size, locking, site).map(Some);
        };

        let offset = self.allocated_fragment(ptr)?;
        let size = size_class::round_up(size).ok_or_else(|| self.out_of_memory(size))?;
        let original = self.header(offset).size();

        if original > size {
            self.split(offset, size, locking);
        } else if original < size {
            let grown =
                self.kind == ArenaKind::Private && self.grow_in_place(offset, size, locking);
            if !grown {
                // The old fragment is not locked while the new one is found,
                // and vice versa: the two lock windows never overlap.
                let new = self.allocate(size, locking, site)?;
                // Safety: both payloads are live, distinct fragments and the
                // new one is at least `size > original` bytes.
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new.cast::<u8>().as_ptr(), original);
                }
                self.free(Some(ptr), locking)?;
                return Ok(Some(new));
            }
        }

        Ok(Some(self.payload(offset)))
    }

    pub(crate) fn stats(&self) -> Option<Stats> {
        self.counters().map(|c| {
            let large_space = self.large_space.load(Ordering::Relaxed);
            c.snapshot(self.size, large_space)
        })
    }

    /// Count the fragments in bucket `bucket`'s free list.
    fn free_count(&self, bucket: usize) -> usize {
        if self.config.use_fast_bucket_counts {
            return self.buckets[bucket].approx_len.load(Ordering::Relaxed);
        }
        let list = self.list(bucket, Locking::Locked);
        let mut count = 0;
        let mut cursor = list.head;
        while let Some(offset) = cursor {
            count += 1;
            cursor = self.header(offset).next();
        }
        count
    }

    /// Free-list occupancy per size class plus arena totals. Takes each bucket
    /// lock in turn, never more than one at once.
    pub(crate) fn status_report(&self) -> StatusReport {
        let mut classes = Vec::new();
        let mut free_fragments = 0;

        for (class, bucket) in self.buckets[..NUM_SIZE_CLASSES].iter().enumerate() {
            let free = match &bucket.ring {
                Some(ring) => FreeCount::Ring(ring.buckets().map(|b| self.free_count(b)).collect()),
                None => FreeCount::Plain(self.free_count(class)),
            };
            free_fragments += free.total();
            if free.total() == 0 && bucket.ring.is_none() {
                continue;
            }
            classes.push(ClassReport {
                class,
                min_size: size_class::lower_bound(class),
                max_size: size_class::upper_bound(class),
                free,
            });
        }

        StatusReport {
            arena: self.name,
            granularity: GRANULARITY,
            overhead: OVERHEAD,
            size: self.size,
            stats: self.stats(),
            classes,
            free_fragments,
            large_space: self.large_space.load(Ordering::Relaxed),
            call_sites: None,
        }
    }

    /// Iterate over every fragment in physical order.
    ///
    /// Only meaningful while nothing splits or merges fragments concurrently.
    fn fragments(&self) -> impl Iterator<Item = (usize, &Header)> + '_ {
        let mut cursor = Some(0);
        core::iter::from_fn(move || {
            let offset = cursor?;
            cursor = self.next_fragment(offset);
            Some((offset, self.header(offset)))
        })
    }

    /// Live fragments grouped by the location that allocated them.
    ///
    /// Only meaningful while nothing splits or merges fragments concurrently.
    pub(crate) fn call_site_summary(&self) -> Vec<CallSiteUsage> {
        let mut by_site = BTreeMap::<&'static Location<'static>, CallSiteUsage>::new();
        for (_, header) in self.fragments() {
            if let FragmentState::Allocated { site: Some(site) } = header.state() {
                let usage = by_site.entry(site).or_insert(CallSiteUsage {
                    site,
                    fragments: 0,
                    bytes: 0,
                });
                usage.fragments += 1;
                usage.bytes += header.size();
            }
        }
        by_site.into_values().collect()
    }

    /// The most requested size classes, as `(size, requests)` pairs.
    pub(crate) fn hot_size_classes(&self, n: usize) -> Vec<(usize, usize)> {
        let mut hot: Vec<(usize, usize)> = self
            .class_usage
            .iter()
            .enumerate()
            .map(|(class, count)| (class, count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hot.truncate(n);
        hot.into_iter()
            .map(|(class, count)| (size_class::upper_bound(class), count))
            .collect()
    }

    /// Verify that the fragment chain tiles the arena exactly, that every free
    /// fragment is correctly linked into the bucket it names, and that the
    /// counters agree with what the walk finds.
    ///
    /// Only meaningful while nothing mutates the arena concurrently.
    pub(crate) fn check_integrity(&self) -> Result<(), ArenaError> {
        let mut offset = 0;
        let mut fragments = 0;
        let mut free_fragments = 0;
        let mut free_bytes: usize = 0;
        let mut large_bytes: usize = 0;
        let mut used_bytes: usize = 0;

        while offset < self.end {
            if !self.is_fragment_offset(offset) {
                return Err(self.corrupted(offset, "header overruns the arena end"));
            }
            let header = self.header(offset);
            let size = header.size();
            if size % GRANULARITY != 0 {
                return Err(self.corrupted(offset, "size is not a multiple of the granularity"));
            }

            match header.state() {
                FragmentState::Allocated { .. } => used_bytes = used_bytes.saturating_add(size),
                FragmentState::Retired => {
                    return Err(self.corrupted(offset, "merged-away header on the fragment chain"));
                }
                FragmentState::Free { bucket, next, prev } => {
                    free_fragments += 1;
                    free_bytes = free_bytes.saturating_add(size);
                    if size > LINEAR_LIMIT {
                        large_bytes = large_bytes.saturating_add(size);
                    }
                    self.check_free_links(offset, size, bucket, next, prev)?;
                }
            }

            fragments += 1;
            offset = match size.checked_add(OVERHEAD).and_then(|s| offset.checked_add(s)) {
                Some(next) => next,
                None => return Err(self.corrupted(offset, "size overflows the address space")),
            };
        }
        if offset != self.end {
            return Err(self.corrupted(offset, "last fragment overruns the arena end"));
        }

        let listed: usize = (0..self.buckets.len())
            .map(|bucket| self.list_len(bucket, fragments))
            .sum();
        if listed != free_fragments {
            return Err(self.corrupted(0, "free lists disagree with the fragment chain"));
        }
        if self.large_space.load(Ordering::Relaxed) != large_bytes {
            return Err(self.corrupted(0, "large space disagrees with the fragment chain"));
        }

        if let Some(stats) = self.stats() {
            if stats.fragments != fragments {
                return Err(self.corrupted(0, "fragment count disagrees with the fragment chain"));
            }
            if stats.used != used_bytes {
                return Err(self.corrupted(0, "used bytes disagree with the fragment chain"));
            }
            if Some(stats.real_used) != self.size.checked_sub(free_bytes) {
                return Err(self.corrupted(0, "real used bytes disagree with the fragment chain"));
            }
        }

        Ok(())
    }

    fn check_free_links(
        &self,
        offset: usize,
        size: usize,
        bucket: usize,
        next: Option<usize>,
        prev: Option<usize>,
    ) -> Result<(), ArenaError> {
        let Some(owner) = self.buckets.get(bucket) else {
            return Err(self.corrupted(offset, "free fragment names an unknown bucket"));
        };
        if owner.class != size_class::of(size) || owner.ring.is_some() {
            return Err(self.corrupted(offset, "free fragment filed under the wrong size class"));
        }
        if let Some(next) = next {
            if !self.is_fragment_offset(next) || self.header(next).prev() != Some(offset) {
                return Err(self.corrupted(offset, "broken forward free-list link"));
            }
        }
        match prev {
            Some(prev) => {
                if !self.is_fragment_offset(prev) || self.header(prev).next() != Some(offset) {
                    return Err(self.corrupted(offset, "broken backward free-list link"));
                }
            }
            None => {
                if self.list(bucket, Locking::Locked).head != Some(offset) {
                    return Err(self.corrupted(offset, "free-list head does not match"));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lock_bucket(&self, bucket: usize) -> MutexGuard<'_, FreeList, L> {
        self.buckets[bucket].free.lock()
    }

    /// Length of a free list, giving up past `limit` entries so a cycle cannot
    /// hang the check.
    fn list_len(&self, bucket: usize, limit: usize) -> usize {
        let list = self.list(bucket, Locking::Locked);
        let mut count = 0;
        let mut cursor = list.head;
        while let Some(offset) = cursor {
            count += 1;
            if count > limit || !self.is_fragment_offset(offset) {
                break;
            }
            cursor = self.header(offset).next();
        }
        count
    }
}
