//! Size classes.
//!
//! Requests are rounded up to [`GRANULARITY`] and hashed into a table of free
//! list buckets:
//!
//! * Up to and including [`LINEAR_LIMIT`] bytes there is one class per granule,
//!   so every fragment in such a bucket has exactly the same size.
//!
//! * Above it, each class covers a power-of-two range `[2^k, 2^(k+1))`. These
//!   buckets hold fragments of differing sizes, so a search within one is a
//!   first-fit scan.

/// Allocation granularity; every payload size is a multiple of this.
pub const GRANULARITY: usize = 16;

const LINEAR_LIMIT_LOG2: u32 = 14;

/// The largest size that has a class of its own.
pub const LINEAR_LIMIT: usize = 1 << LINEAR_LIMIT_LOG2;

/// Number of exact-size classes.
pub const LINEAR_CLASSES: usize = LINEAR_LIMIT / GRANULARITY;

/// Number of power-of-two classes above the linear range.
pub const EXPONENTIAL_CLASSES: usize = (usize::BITS - LINEAR_LIMIT_LOG2) as usize + 1;

/// Total number of size classes.
pub const NUM_SIZE_CLASSES: usize = LINEAR_CLASSES + EXPONENTIAL_CLASSES;

/// A free fragment is only split when the remainder would have at least this
/// many payload bytes.
pub const MIN_SPLIT_SIZE: usize = 64;

/// Round a request up to the allocation granularity.
///
/// Zero-byte requests get one granule. Returns `None` on overflow.
#[inline]
pub const fn round_up(size: usize) -> Option<usize> {
    if size == 0 {
        return Some(GRANULARITY);
    }
    match size.checked_add(GRANULARITY - 1) {
        Some(s) => Some(s & !(GRANULARITY - 1)),
        None => None,
    }
}

/// The size class of a (rounded) size.
#[inline]
pub const fn of(size: usize) -> usize {
    if size <= LINEAR_LIMIT {
        size / GRANULARITY
    } else {
        LINEAR_CLASSES + (size.ilog2() - LINEAR_LIMIT_LOG2) as usize + 1
    }
}

/// The smallest size that hashes to `class`.
#[inline]
pub const fn lower_bound(class: usize) -> usize {
    if class <= LINEAR_CLASSES {
        class * GRANULARITY
    } else {
        let shift = (class - LINEAR_CLASSES) as u32 + LINEAR_LIMIT_LOG2 - 1;
        if class == LINEAR_CLASSES + 1 {
            LINEAR_LIMIT + GRANULARITY
        } else {
            1 << shift
        }
    }
}

/// The largest size that hashes to `class`.
#[inline]
pub const fn upper_bound(class: usize) -> usize {
    if class <= LINEAR_CLASSES {
        class * GRANULARITY
    } else if class + 1 >= NUM_SIZE_CLASSES {
        usize::MAX & !(GRANULARITY - 1)
    } else {
        lower_bound(class + 1) - GRANULARITY
    }
}

/// Is `class` one of the exact-size classes?
#[inline]
pub const fn is_linear(class: usize) -> bool {
    class <= LINEAR_CLASSES
}

/// Can a free fragment of `fragment_size` payload bytes serving a request of
/// `size` bytes be split, leaving a useful remainder?
#[inline]
pub const fn can_split(fragment_size: usize, size: usize) -> bool {
    fragment_size >= size + crate::fragment::OVERHEAD + MIN_SPLIT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up(0), Some(16));
        assert_eq!(round_up(1), Some(16));
        assert_eq!(round_up(16), Some(16));
        assert_eq!(round_up(100), Some(112));
        assert_eq!(round_up(usize::MAX), None);
    }

    #[test]
    fn linear_classes_are_exact() {
        assert_eq!(of(16), 1);
        assert_eq!(of(112), 7);
        assert_eq!(of(LINEAR_LIMIT), LINEAR_CLASSES);
        for class in 1..=LINEAR_CLASSES {
            assert_eq!(lower_bound(class), upper_bound(class));
            assert_eq!(of(lower_bound(class)), class);
        }
    }

    #[test]
    fn exponential_classes_cover_their_ranges() {
        assert_eq!(of(LINEAR_LIMIT + GRANULARITY), LINEAR_CLASSES + 1);
        assert_eq!(of(2 * LINEAR_LIMIT - GRANULARITY), LINEAR_CLASSES + 1);
        assert_eq!(of(2 * LINEAR_LIMIT), LINEAR_CLASSES + 2);
        for class in LINEAR_CLASSES + 1..NUM_SIZE_CLASSES {
            assert_eq!(of(lower_bound(class)), class, "class {class}");
            assert_eq!(of(upper_bound(class)), class, "class {class}");
        }
        assert_eq!(of(usize::MAX & !(GRANULARITY - 1)), NUM_SIZE_CLASSES - 1);
    }

    #[test]
    fn classes_are_monotonic() {
        let mut prev = 0;
        let mut size = GRANULARITY;
        while size < 1 << 24 {
            let class = of(size);
            assert!(class >= prev);
            prev = class;
            size += GRANULARITY * 7;
        }
    }
}
