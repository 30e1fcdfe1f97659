//! Subset enumeration over described fields.
//!
//! Fields are addressed by position, a subset is a bitmask over those
//! positions, and a subset is relevant iff it shares at least one bit with
//! the mask of modified fields. For `k` fields and `r` relevant ones there
//! are `2^k - 2^(k-r)` relevant subsets.

/// Upper bound on described fields; keeps masks in a `u32` and batches at
/// most 65 535 identifiers.
pub const MAX_DESCRIBED_FIELDS: usize = 16;

/// Mask with the low `k` bits set.
pub fn full_mask(k: usize) -> u32 {
    debug_assert!(k <= MAX_DESCRIBED_FIELDS);
    (1u32 << k) - 1
}

/// Number of subsets [`relevant_subsets`] yields.
pub fn subset_count(k: usize, relevant_mask: u32) -> usize {
    let r = (relevant_mask & full_mask(k)).count_ones() as usize;
    (1usize << k) - (1usize << (k - r))
}

/// Positions of the set bits of `mask`, lowest first.
pub fn positions(mask: u32) -> impl Iterator<Item = usize> {
    (0..u32::BITS as usize).filter(move |bit| mask & (1 << bit) != 0)
}

/// Every non-empty subset of `k` fields that intersects `relevant_mask`,
/// in increasing mask order.
pub fn relevant_subsets(k: usize, relevant_mask: u32) -> RelevantSubsets {
    let full = full_mask(k);
    RelevantSubsets {
        next: 1,
        full,
        relevant: relevant_mask & full,
    }
}

/// Iterator returned by [`relevant_subsets`].
#[derive(Debug, Clone)]
pub struct RelevantSubsets {
    next: u32,
    full: u32,
    relevant: u32,
}

impl Iterator for RelevantSubsets {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.relevant == 0 {
            return None;
        }
        while self.next <= self.full {
            let mask = self.next;
            self.next += 1;
            if mask & self.relevant != 0 {
                return Some(mask);
            }
        }
        None
    }
}
