//! Construction-time arena configuration.

use alloc::vec::Vec;

/// Knobs read once when an arena is built.
///
/// Instrumentation layers are plain flags here rather than cargo features, so
/// one build can host differently instrumented arenas side by side.
#[derive(Clone, Debug)]
pub struct Config {
    /// Record the `#[track_caller]` location of every allocation, for
    /// [`call_site_summary`](crate::PrivateArena::call_site_summary).
    pub track_call_sites: bool,

    /// Maintain the `used`/`real_used`/high-water counters. Without them,
    /// `stats()` returns `None` and out-of-memory reports omit the free space.
    pub maintain_statistics: bool,

    /// Keep an approximate, lock-free fragment count per bucket. The status
    /// report then reads those counts instead of locking and walking every
    /// free list.
    pub use_fast_bucket_counts: bool,

    /// Request sizes whose size class should be fanned out into a ring of
    /// secondary buckets. Only honored by the shared arena, and only for sizes
    /// within the exact-size range.
    pub optimized_sizes: Vec<usize>,

    /// Number of secondary buckets per optimized size class.
    pub secondary_ring_size: usize,

    /// Log level used by `status()`.
    pub status_level: log::Level,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            track_call_sites: false,
            maintain_statistics: true,
            use_fast_bucket_counts: false,
            optimized_sizes: Vec::new(),
            secondary_ring_size: 8,
            status_level: log::Level::Info,
        }
    }
}

impl Config {
    /// Same as `Config::default()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable call-site tracking.
    pub fn track_call_sites(mut self, enable: bool) -> Self {
        self.track_call_sites = enable;
        self
    }

    /// Enable or disable usage statistics.
    pub fn maintain_statistics(mut self, enable: bool) -> Self {
        self.maintain_statistics = enable;
        self
    }

    /// Enable or disable approximate per-bucket counts.
    pub fn use_fast_bucket_counts(mut self, enable: bool) -> Self {
        self.use_fast_bucket_counts = enable;
        self
    }

    /// Fan the size classes of `sizes` out into rings of `ring_size` buckets.
    pub fn optimize_sizes(
        mut self,
        sizes: impl IntoIterator<Item = usize>,
        ring_size: usize,
    ) -> Self {
        self.optimized_sizes = sizes.into_iter().collect();
        self.secondary_ring_size = ring_size;
        self
    }

    /// Set the log level for status dumps.
    pub fn status_level(mut self, level: log::Level) -> Self {
        self.status_level = level;
        self
    }
}
