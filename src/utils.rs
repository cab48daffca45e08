//! Helper functions shared by the pool structures. None of them belongs to a
//! concrete module of the allocator.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// This is how the bump cursor of a [`crate::block::Block`] is moved to the next
/// header position and how the pool constants are derived. `alignment` has to be
/// a power of two.
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Rounds `to_be_aligned` down to the previous multiple of `alignment`.
///
/// Used to clamp the small/large threshold so that an aligned effective size can
/// hit it exactly.
#[inline]
pub const fn align_down(to_be_aligned: usize, alignment: usize) -> usize {
    to_be_aligned & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn align_pointer_size() {
        let alignments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, mem::size_of::<usize>()));
            }
        }
    }

    #[test]
    fn align_pool_alignment() {
        let alignments = vec![(1..16, 16), (17..32, 32), (33..48, 48)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, 16));
            }
        }
    }

    #[test]
    fn align_down_never_exceeds_input() {
        assert_eq!(4088, align_down(4095, 8));
        assert_eq!(4096, align_down(4096, 8));
        assert_eq!(0, align_down(7, 8));
    }
}
