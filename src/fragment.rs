//! Fragment headers.
//!
//! Every fragment starts with a [`Header`] and is immediately followed by its
//! payload. Fragments tile the arena: a fragment at offset `o` with payload
//! size `s` is followed by the next fragment at `o + OVERHEAD + s`, and the last
//! one ends exactly at the arena's end sentinel.
//!
//! Header words are atomics so that a racing double free, or a diagnostic walk,
//! observes stale values rather than causing a data race. All accesses are
//! `Relaxed`: ordering comes from the bucket locks, or from whatever the caller
//! used to hand an allocation between threads.

use core::{
    panic::Location,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

/// Bytes of bookkeeping in front of every payload.
pub const OVERHEAD: usize = core::mem::size_of::<Header>();

const NIL: usize = usize::MAX;
const ALLOCATED: usize = 0;
const RETIRED: usize = usize::MAX;

/// The decoded state of a fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FragmentState {
    /// Handed out to a caller.
    Allocated {
        site: Option<&'static Location<'static>>,
    },
    /// Sitting in bucket `bucket`'s free list.
    Free {
        bucket: usize,
        next: Option<usize>,
        prev: Option<usize>,
    },
    /// No longer a fragment boundary: swallowed by the fragment in front of it.
    Retired,
}

#[repr(C, align(16))]
pub(crate) struct Header {
    size: AtomicUsize,
    /// `ALLOCATED`, `bucket + 1` while free, or `RETIRED`.
    state: AtomicUsize,
    next: AtomicUsize,
    prev: AtomicUsize,
    site: AtomicPtr<Location<'static>>,
}

const _: () = assert!(OVERHEAD % crate::size_class::GRANULARITY == 0);

fn encode(link: Option<usize>) -> usize {
    link.unwrap_or(NIL)
}

fn decode(word: usize) -> Option<usize> {
    (word != NIL).then_some(word)
}

impl Header {
    /// A header for a fragment that is not (yet) in any free list.
    pub(crate) fn new(size: usize) -> Self {
        Header {
            size: AtomicUsize::new(size),
            state: AtomicUsize::new(ALLOCATED),
            next: AtomicUsize::new(NIL),
            prev: AtomicUsize::new(NIL),
            site: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.state.load(Ordering::Relaxed) != ALLOCATED
    }

    pub(crate) fn state(&self) -> FragmentState {
        match self.state.load(Ordering::Relaxed) {
            ALLOCATED => FragmentState::Allocated { site: self.site() },
            RETIRED => FragmentState::Retired,
            tagged => FragmentState::Free {
                bucket: tagged - 1,
                next: self.next(),
                prev: self.prev(),
            },
        }
    }

    #[inline]
    pub(crate) fn next(&self) -> Option<usize> {
        decode(self.next.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn prev(&self) -> Option<usize> {
        decode(self.prev.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_next(&self, next: Option<usize>) {
        self.next.store(encode(next), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_prev(&self, prev: Option<usize>) {
        self.prev.store(encode(prev), Ordering::Relaxed);
    }

    pub(crate) fn mark_free(&self, bucket: usize, next: Option<usize>) {
        self.set_next(next);
        self.set_prev(None);
        self.state.store(bucket + 1, Ordering::Relaxed);
    }

    pub(crate) fn mark_allocated(&self) {
        self.state.store(ALLOCATED, Ordering::Relaxed);
        self.set_next(None);
        self.set_prev(None);
    }

    /// Leave a tombstone behind once merged away, so a stale pointer to this
    /// header still reads as not allocated.
    pub(crate) fn retire(&self) {
        self.state.store(RETIRED, Ordering::Relaxed);
    }

    pub(crate) fn site(&self) -> Option<&'static Location<'static>> {
        let site = self.site.load(Ordering::Relaxed);
        // Safety: only ever stored from a `&'static Location<'static>`.
        unsafe { site.cast_const().as_ref() }
    }

    pub(crate) fn set_site(&self, site: Option<&'static Location<'static>>) {
        let site = site.map_or(ptr::null_mut(), |l| ptr::from_ref(l).cast_mut());
        self.site.store(site, Ordering::Relaxed);
    }
}
