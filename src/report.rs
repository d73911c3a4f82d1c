//! Diagnostic status reports.

use alloc::{string::ToString, vec::Vec};
use core::{fmt, panic::Location};

use crate::{size_class, stats::Stats};

/// Free fragments in one size class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FreeCount {
    /// A plain bucket.
    Plain(usize),
    /// An optimized class: one count per secondary bucket of its ring.
    Ring(Vec<usize>),
}

impl FreeCount {
    /// Free fragments across the whole class.
    pub fn total(&self) -> usize {
        match self {
            FreeCount::Plain(n) => *n,
            FreeCount::Ring(counts) => counts.iter().sum(),
        }
    }
}

/// One line of the free-fragment table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassReport {
    /// Size-class index.
    pub class: usize,
    /// Smallest payload size filed under this class.
    pub min_size: usize,
    /// Largest payload size filed under this class.
    pub max_size: usize,
    /// Free fragments currently in the class.
    pub free: FreeCount,
}

/// Live allocations made from one source location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSiteUsage {
    /// Where the allocations were made.
    pub site: &'static Location<'static>,
    /// Number of live fragments.
    pub fragments: usize,
    /// Their total payload size.
    pub bytes: usize,
}

/// A point-in-time picture of an arena, for humans.
///
/// Counts taken while other processes keep allocating are a best effort: each
/// bucket is consistent on its own, the whole table is not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    /// The arena's name.
    pub arena: &'static str,
    /// Allocation granularity.
    pub granularity: usize,
    /// Per-fragment overhead.
    pub overhead: usize,
    /// Size of the arena's region.
    pub size: usize,
    /// Usage counters, when maintained.
    pub stats: Option<Stats>,
    /// Classes holding free fragments, and every optimized class.
    pub classes: Vec<ClassReport>,
    /// Free fragments across all classes.
    pub free_fragments: usize,
    /// Free bytes in the power-of-two classes.
    pub large_space: usize,
    /// Live allocations by call site, when tracked and requested.
    pub call_sites: Option<Vec<CallSiteUsage>>,
}

impl StatusReport {
    /// The report's entry for `class`, if it made it into the table.
    pub fn class(&self, class: usize) -> Option<&ClassReport> {
        self.classes.iter().find(|c| c.class == class)
    }

    /// Write the report to the log, one record per line.
    pub fn log(&self, level: log::Level) {
        for line in self.to_string().lines() {
            log::log!(level, "{line}");
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} arena status (granularity={}):",
            self.arena, self.granularity
        )?;
        writeln!(f, "{:>20} : {}", "size classes", size_class::NUM_SIZE_CLASSES)?;
        writeln!(f, "{:>20} : {}", "total_size", self.size)?;
        if let Some(stats) = &self.stats {
            writeln!(f, "{:>20} : {}", "used", stats.used)?;
            writeln!(f, "{:>20} : {}", "used+overhead", stats.real_used)?;
            writeln!(f, "{:>20} : {}", "free", stats.free)?;
            writeln!(f, "{:>20} : {}", "max_used (+overhead)", stats.max_real_used)?;
            writeln!(f, "{:>20} : {}", "fragments", stats.fragments)?;
        }

        if let Some(sites) = &self.call_sites {
            writeln!(f, "live fragments by call site:")?;
            writeln!(f, "------------+---------------------------------------")?;
            writeln!(f, "total_bytes | num_allocations x [file:line:column]")?;
            writeln!(f, "------------+---------------------------------------")?;
            for usage in sites {
                writeln!(
                    f,
                    " {:>10} : {} x [{}]",
                    usage.bytes, usage.fragments, usage.site
                )?;
            }
            writeln!(f, "----------------------------------------------------")?;
        }

        writeln!(f, "free fragments:")?;
        for class in &self.classes {
            if size_class::is_linear(class.class) {
                write!(f, "[ {:>4} ][ {:>5} B ]", class.class, class.min_size)?;
            } else {
                write!(
                    f,
                    "[ {:>4} ][ {:>8} B -> {:>7} B ]",
                    class.class, class.min_size, class.max_size
                )?;
            }
            match &class.free {
                FreeCount::Plain(n) => writeln!(f, "[ frags: {n:>5} ]")?,
                FreeCount::Ring(counts) => {
                    write!(f, "[ frags: ")?;
                    for (i, n) in counts.iter().enumerate() {
                        if i > 0 {
                            write!(f, "| ")?;
                        }
                        write!(f, "{n:>5} ")?;
                    }
                    writeln!(f, "]")?;
                }
            }
        }
        writeln!(f, "TOTAL: {:>6} free fragments", self.free_fragments)?;
        writeln!(f, "TOTAL: {} large bytes", self.large_space)?;
        writeln!(f, "TOTAL: {} overhead", self.overhead)?;
        write!(f, "-----------------------------")
    }
}
