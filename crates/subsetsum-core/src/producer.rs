//! Work-packet generation: the single producer unfolds the main region into
//! `NodeSubset` packets and streams them into the ring.

use crate::direct::DirectPush;
use crate::preprocess::HashLayout;
use crate::ring::SpanQueue;

/// One work packet: a fixed assignment of the main region.
///
/// `sum` carries only the low 64 bits of the partial sum; workers reduce
/// against 64-bit hash keys, and verification recomputes the exact 128-bit
/// value from the subset mask. The mask uses the reordered numbering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NodeSubset {
    /// Low 64 bits of the partial sum.
    pub sum: i64,
    /// Partial subset bitmask, low word first.
    pub subset: [u64; 2],
}

impl NodeSubset {
    /// Packs a packet.
    #[must_use]
    pub fn new(sum: i64, subset: u128) -> Self {
        Self {
            sum,
            subset: [subset as u64, (subset >> 64) as u64],
        }
    }

    /// The partial subset bitmask.
    #[must_use]
    pub fn subset_bits(&self) -> u128 {
        u128::from(self.subset[0]) | (u128::from(self.subset[1]) << 64)
    }
}

/// Applies the toggled-bit deltas of a plain-increment step to the running
/// 128-bit sum. The toggled bits of `prev ^ next` are contiguous from bit 0,
/// so the walk stops at the first untouched bit.
#[inline]
fn apply_toggles(numbers: &[i128], prev: u128, next: u128, sum: &mut i128) {
    let changes = prev ^ next;
    let mut bit = 1u128;
    let mut bit_num = 0usize;
    while bit & changes != 0 && bit_num < 128 {
        if next & bit != 0 {
            *sum += numbers[bit_num];
        } else {
            *sum -= numbers[bit_num];
        }
        bit <<= 1;
        bit_num += 1;
    }
}

/// Enumerates all `2^(n-14)` main-region assignments in increment order,
/// pushing one packet each. Stops early when the ring is closed or
/// cancelled. The naive method keeps the original input order, so the packet
/// mask is already in input numbering.
pub fn generate_naive(numbers: &[i128], queue: &SpanQueue<NodeSubset>) {
    let main_bits = numbers.len() - 14;
    let max_subset: u128 = 1u128 << main_bits;
    let mut pusher = DirectPush::new(queue, 0);
    let mut sum: i128 = 0;
    let mut prev_subset: u128 = 0;
    let mut subset: u128 = 0;
    loop {
        apply_toggles(numbers, prev_subset, subset, &mut sum);
        prev_subset = subset;
        if !pusher.push(NodeSubset::new(sum as i64, subset)) {
            break;
        }
        subset += 1;
        if subset == max_subset {
            break;
        }
    }
    pusher.finish();
}

/// Enumerates the main region by DFS, descending only while the residual
/// stays inside the per-level gate; whole infeasible subtrees are skipped.
pub fn generate_hash(layout: &HashLayout, queue: &SpanQueue<NodeSubset>) {
    let main_numbers = layout.main_problem.len();
    let mut pusher = DirectPush::new(queue, 0);

    let mut sum: i128 = 0;
    let mut subset: u128 = 0;
    let mut range_index: isize = main_numbers as isize - 1;

    'outer: loop {
        while range_index >= 0 {
            let gate = &layout.min_max[range_index as usize];
            if sum < gate.min_value || sum > gate.max_value {
                break;
            }
            range_index -= 1;
        }

        if range_index == -1 {
            if !pusher.push(NodeSubset::new(sum as i64, subset)) {
                break 'outer;
            }
            range_index = 0;
        }

        // backtrack through the highest run of set bits
        while range_index < main_numbers as isize && subset & (1u128 << range_index) != 0 {
            subset &= !(1u128 << range_index);
            sum -= layout.main_problem[range_index as usize];
            range_index += 1;
        }
        if range_index >= main_numbers as isize {
            break;
        }
        subset |= 1u128 << range_index;
        sum += layout.main_problem[range_index as usize];
    }
    pusher.finish();
}

/// Exhaustive fallback for problems too small to split: walks every
/// non-empty subset with incremental sum updates and emits the zero sums.
pub fn solve_small(numbers: &[i128], mut emit: impl FnMut(u128)) {
    let max_subset: u128 = 1u128 << numbers.len();
    let mut sum: i128 = 0;
    let mut prev_subset: u128 = 0;
    let mut subset: u128 = 1;
    while subset != max_subset {
        apply_toggles(numbers, prev_subset, subset, &mut sum);
        prev_subset = subset;
        if sum == 0 {
            emit(subset);
        }
        subset += 1;
    }
}
