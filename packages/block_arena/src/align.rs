//! Address arithmetic for bump allocation.
//!
//! This is the only place in the crate that reasons about raw addresses. Everything else asks
//! these helpers how much padding an allocation needs and works in byte offsets from there.

/// Returns the number of bytes that must be skipped from `addr` to reach an address that is a
/// multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is zero.
#[must_use]
pub(crate) fn padding_for(addr: usize, align: usize) -> usize {
    assert!(align > 0, "alignment must be non-zero");

    // The remainder is always less than `align`, so the subtraction cannot underflow.
    let misalignment = addr % align;

    if misalignment == 0 {
        0
    } else {
        align.wrapping_sub(misalignment)
    }
}

/// Rounds `size` up to the next multiple of `align`, returning `None` on overflow.
#[must_use]
pub(crate) fn round_up(size: usize, align: usize) -> Option<usize> {
    size.checked_add(padding_for(size, align))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn aligned_address_needs_no_padding() {
        assert_eq!(padding_for(0, 8), 0);
        assert_eq!(padding_for(64, 8), 0);
        assert_eq!(padding_for(4096, 4096), 0);
    }

    #[test]
    fn misaligned_address_is_padded_to_next_boundary() {
        assert_eq!(padding_for(1, 8), 7);
        assert_eq!(padding_for(9, 8), 7);
        assert_eq!(padding_for(15, 8), 1);
        assert_eq!(padding_for(17, 16), 15);
    }

    #[test]
    fn any_address_is_byte_aligned() {
        for addr in 0..100 {
            assert_eq!(padding_for(addr, 1), 0);
        }
    }

    #[test]
    fn padded_address_is_aligned() {
        for align in [1_usize, 2, 4, 8, 16, 64] {
            for addr in 0..200 {
                let padded = addr + padding_for(addr, align);
                assert_eq!(padded % align, 0);
                assert!(padded - addr < align);
            }
        }
    }

    #[test]
    fn round_up_handles_overflow() {
        assert_eq!(round_up(1000, 8), Some(1000));
        assert_eq!(round_up(1001, 8), Some(1008));
        assert_eq!(round_up(usize::MAX, 8), None);
    }

    #[test]
    #[should_panic]
    fn zero_alignment_panics() {
        _ = padding_for(10, 0);
    }
}
