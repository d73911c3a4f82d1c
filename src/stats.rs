//! Usage accounting.
//!
//! The arena-wide counters are updated with relaxed atomics and without a lock
//! of their own. Under contention they are an estimate, which is all the
//! diagnostics need.

use core::{
    cell::Cell,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A snapshot of an arena's usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Size of the region handed to the arena.
    pub size: usize,
    /// Payload bytes currently handed out to callers.
    pub used: usize,
    /// Everything that is not free payload: `used` plus every fragment header
    /// plus alignment slack.
    pub real_used: usize,
    /// Highest `real_used` ever observed.
    pub max_real_used: usize,
    /// `size - real_used`.
    pub free: usize,
    /// Free payload bytes held in the power-of-two size classes.
    pub large_space: usize,
    /// Number of fragments, free or not.
    pub fragments: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    used: AtomicUsize,
    real_used: AtomicUsize,
    max_real_used: AtomicUsize,
    fragments: AtomicUsize,
}

impl Counters {
    pub(crate) fn new(real_used: usize) -> Self {
        Counters {
            used: AtomicUsize::new(0),
            real_used: AtomicUsize::new(real_used),
            max_real_used: AtomicUsize::new(0),
            fragments: AtomicUsize::new(1),
        }
    }

    /// A fragment of `size` payload bytes entered a free list.
    #[inline]
    pub(crate) fn attached(&self, size: usize) {
        self.real_used.fetch_sub(size, Ordering::Relaxed);
    }

    /// A fragment of `size` payload bytes left a free list.
    #[inline]
    pub(crate) fn detached(&self, size: usize) {
        self.real_used.fetch_add(size, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn grow_used(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn shrink_used(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn split(&self) {
        self.fragments.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn merged(&self) {
        self.fragments.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn update_high_water(&self) {
        let real_used = self.real_used.load(Ordering::Relaxed);
        self.max_real_used.fetch_max(real_used, Ordering::Relaxed);
    }

    pub(crate) fn free(&self, size: usize) -> usize {
        size.saturating_sub(self.real_used.load(Ordering::Relaxed))
    }

    pub(crate) fn snapshot(&self, size: usize, large_space: usize) -> Stats {
        let used = self.used.load(Ordering::Relaxed);
        let real_used = self.real_used.load(Ordering::Relaxed);
        Stats {
            size,
            used,
            real_used,
            max_real_used: self.max_real_used.load(Ordering::Relaxed),
            free: size.saturating_sub(real_used),
            large_space,
            fragments: self.fragments.load(Ordering::Relaxed),
        }
    }
}

/// Hook invoked after every private-arena mutation with fresh statistics.
///
/// This is where a runtime reacts to memory pressure, for example by warning
/// when usage crosses a configured threshold.
pub trait UsageMonitor {
    /// Inspect the arena's usage after a mutation.
    fn check(&self, arena: &str, stats: &Stats);
}

impl UsageMonitor for () {
    #[inline]
    fn check(&self, _arena: &str, _stats: &Stats) {}
}

/// A [`UsageMonitor`] that logs a warning when `real_used` rises above
/// `percent` of the arena, and again only after it has dropped back below.
#[derive(Debug)]
pub struct LowMemoryWarning {
    percent: usize,
    above: Cell<bool>,
}

impl LowMemoryWarning {
    /// Warn when usage exceeds `percent` (0..=100) of the arena.
    pub fn new(percent: usize) -> Self {
        LowMemoryWarning {
            percent: percent.min(100),
            above: Cell::new(false),
        }
    }

    /// Is usage currently above the threshold?
    pub fn is_above(&self) -> bool {
        self.above.get()
    }
}

impl UsageMonitor for LowMemoryWarning {
    fn check(&self, arena: &str, stats: &Stats) {
        let above = stats.real_used.saturating_mul(100) > stats.size.saturating_mul(self.percent);
        if above && !self.above.get() {
            log::warn!(
                "{arena} memory above {}% threshold: {} of {} bytes in use",
                self.percent,
                stats.real_used,
                stats.size
            );
        }
        self.above.set(above);
    }
}
