use core::fmt;

/// Errors reported by arena operations.
///
/// Every error is logged where it is detected; the caller decides whether it
/// is fatal. An out-of-memory in the shared arena usually is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// No fragment in any size class can satisfy the request.
    OutOfMemory {
        /// The arena's name.
        arena: &'static str,
        /// The rounded request size.
        requested: usize,
        /// Free bytes left, when statistics are maintained.
        free: Option<usize>,
    },

    /// The fragment handed to `free`/`reallocate` is already free.
    DoubleFree {
        /// The arena's name.
        arena: &'static str,
        /// Offset of the fragment within the arena.
        offset: usize,
    },

    /// The pointer does not denote the payload of any fragment in this arena.
    InvalidPointer {
        /// The arena's name.
        arena: &'static str,
        /// The offending address.
        address: usize,
    },

    /// The region handed to the arena cannot hold even one fragment.
    RegionTooSmall {
        /// Size of the region, in bytes.
        size: usize,
        /// Smallest usable region, in bytes.
        minimum: usize,
    },

    /// A fragment header disagrees with the physical layout of the arena.
    Corrupted {
        /// The arena's name.
        arena: &'static str,
        /// Offset of the offending fragment.
        offset: usize,
        /// What was inconsistent.
        reason: &'static str,
    },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::OutOfMemory {
                arena,
                requested,
                free: Some(free),
            } => write!(
                f,
                "not enough free {arena} memory ({free} bytes left, need {requested})"
            ),
            ArenaError::OutOfMemory {
                arena,
                requested,
                free: None,
            } => write!(f, "not enough free {arena} memory (need {requested} bytes)"),
            ArenaError::DoubleFree { arena, offset } => {
                write!(f, "double free of {arena} fragment at offset {offset:#x}")
            }
            ArenaError::InvalidPointer { arena, address } => {
                write!(f, "{address:#x} is not a {arena} allocation")
            }
            ArenaError::RegionTooSmall { size, minimum } => write!(
                f,
                "region of {size} bytes is too small for an arena (minimum {minimum})"
            ),
            ArenaError::Corrupted {
                arena,
                offset,
                reason,
            } => write!(f, "{arena} arena corrupted at offset {offset:#x}: {reason}"),
        }
    }
}

impl core::error::Error for ArenaError {}
