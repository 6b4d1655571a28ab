//! CPU worker loops: pop packets, scan the node region, verify hits in
//! 128-bit arithmetic and emit solutions.

use crate::controller::Controller;
use crate::direct::DirectPop;
use crate::kernels::{naive_scan, NaiveKernel};
use crate::node_hash::{fold_key, NodeHash, SubsumTables};
use crate::preprocess::HashLayout;

/// Packets consumed per naive CPU reservation span.
const NAIVE_POP_SPAN: usize = 8192;
/// Packets consumed per hash CPU reservation span.
const HASH_POP_SPAN: usize = 16384;

/// Queue share a naive CPU worker contributes to the ring sizing.
#[must_use]
pub fn naive_cpu_queue_size() -> usize {
    NAIVE_POP_SPAN
}

/// Queue share a hash CPU worker contributes to the ring sizing.
#[must_use]
pub fn hash_cpu_queue_size() -> usize {
    HASH_POP_SPAN
}

/// Verifies one naive kernel hit: retries all 512 nine-bit suffixes of the
/// hit prefix with exact 128-bit sums (the kernel only witnessed a 64-bit
/// match) and emits every non-empty zero-sum mask.
pub(crate) fn check_and_send_naive(ctl: &Controller, initial_subset: u128, found_index: u32) {
    let numbers = ctl.numbers();
    let n = numbers.len();

    // the packet only carries the low sum half; rebuild the exact value
    let mut index_sum: i128 = 0;
    for (i, &value) in numbers.iter().enumerate().take(n - 14) {
        if initial_subset & (1u128 << i) != 0 {
            index_sum += value;
        }
    }
    for x in 0..5 {
        if found_index & (1 << x) != 0 {
            index_sum += numbers[n - 14 + x];
        }
    }

    let mut prev_subset = 0u32;
    let mut sum = index_sum;
    for subset in 0..512u32 {
        let changes = prev_subset ^ subset;
        let mut bit = 1u32;
        let mut bit_num = 0usize;
        while bit & changes != 0 && bit_num < 9 {
            if subset & bit != 0 {
                sum += numbers[n - 9 + bit_num];
            } else {
                sum -= numbers[n - 9 + bit_num];
            }
            bit <<= 1;
            bit_num += 1;
        }
        prev_subset = subset;
        let final_subset = initial_subset
            | (u128::from(subset) << (n - 9))
            | (u128::from(found_index) << (n - 14));
        if sum == 0 && final_subset != 0 {
            ctl.put_solution(final_subset);
        }
    }
}

/// Naive worker loop. SIMD kernels consume two packets per scan; a lone tail
/// packet re-feeds its own sum into the second lane, whose hits are dropped.
pub fn naive_cpu_worker(ctl: &Controller, kernel: NaiveKernel) {
    if ctl.numbers().len() <= 16 {
        return;
    }
    let sum_changes = ctl.naive_sum_changes();
    let mut popper = DirectPop::new(ctl.mem_queue(), NAIVE_POP_SPAN);
    let mut found = [0u32; 64];
    let mut nodes_count: u64 = 0;
    let mut last_subset: u128 = 0;

    if kernel.is_paired() {
        while let Some(node) = popper.pop() {
            let node2 = popper.pop();
            let sum2 = node2.map_or(node.sum, |n2| n2.sum);
            let found_num = naive_scan(kernel, sum_changes, node.sum, sum2, &mut found);
            for &index in &found[..found_num] {
                if index < 32 {
                    check_and_send_naive(ctl, node.subset_bits(), index);
                } else if let Some(node2) = node2 {
                    check_and_send_naive(ctl, node2.subset_bits(), index - 32);
                }
            }
            nodes_count += 1 + u64::from(node2.is_some());
            last_subset = node.subset_bits();
            if nodes_count & 0xffe == 0 {
                ctl.update_progress(nodes_count, last_subset);
                nodes_count = 0;
            }
        }
    } else {
        while let Some(node) = popper.pop() {
            let found_num = naive_scan(kernel, sum_changes, node.sum, 0, &mut found);
            for &index in &found[..found_num] {
                check_and_send_naive(ctl, node.subset_bits(), index);
            }
            nodes_count += 1;
            last_subset = node.subset_bits();
            if nodes_count & 0xfff == 0 {
                ctl.update_progress(nodes_count, last_subset);
                nodes_count = 0;
            }
        }
    }
    ctl.update_progress(nodes_count, last_subset);
}

/// Probes all 256 SIMD-prefix candidates against stored 64-bit sums.
fn probe_sums(
    layout: &HashLayout,
    hash: &NodeHash,
    lists: &[i64],
    input_sum: i64,
    found: &mut [u32; 256],
) -> usize {
    let hash_bits = layout.node_hash_bits;
    let mut found_num = 0usize;
    for current in 0..256usize {
        let sum = input_sum.wrapping_add(layout.sum_changes[current]);
        let entry = hash.entries[fold_key(sum, hash_bits) as usize];
        if entry.size != 0 {
            let start = entry.pos() as usize;
            let bucket = &lists[start..start + entry.size as usize];
            if bucket.contains(&sum) {
                found[found_num] = current as u32;
                found_num += 1;
            }
        }
    }
    found_num
}

/// Probes against stored subset indices, rebuilding each stored sum from the
/// 8-bit-chunk subsum tables (1-4 lookups).
fn probe_subsets(
    layout: &HashLayout,
    hash: &NodeHash,
    subsums: &SubsumTables,
    input_sum: i64,
    found: &mut [u32; 256],
) -> usize {
    let hash_bits = layout.node_hash_bits;
    let mut found_num = 0usize;
    for current in 0..256usize {
        let sum = input_sum.wrapping_add(layout.sum_changes[current]);
        let entry = hash.entries[fold_key(sum, hash_bits) as usize];
        if entry.size != 0 {
            let start = entry.pos() as usize;
            let bucket = &hash.subsets[start..start + entry.size as usize];
            if bucket.iter().any(|&subset| subsums.sum(subset) == sum) {
                found[found_num] = current as u32;
                found_num += 1;
            }
        }
    }
    found_num
}

/// Verifies one hash-worker hit: rebuilds the exact 128-bit prefix sum,
/// re-probes the bucket, and for every stored suffix whose full sum is zero
/// translates the combined mask back to input numbering and emits it.
pub(crate) fn check_and_send_hash(
    ctl: &Controller,
    layout: &HashLayout,
    hash: &NodeHash,
    initial_subset: u128,
    found_index: u32,
) {
    let n = ctl.numbers().len();
    let node_bits = layout.node_bits as usize;
    let hashed_numbers = layout.node_hashed_numbers as usize;
    let main_count = n - node_bits;

    let mut index_sum: i128 = 0;
    for (i, &value) in layout.main_problem.iter().enumerate().take(main_count) {
        if initial_subset & (1u128 << i) != 0 {
            index_sum += value;
        }
    }
    for x in 0..8 {
        if found_index & (1 << x) != 0 {
            index_sum += layout.node_problem[x];
        }
    }

    let key = fold_key(index_sum as i64, layout.node_hash_bits);
    let entry = hash.entries[key as usize];
    if entry.size == 0 {
        return;
    }
    let start = entry.pos() as usize;
    for &hashed_subset in &hash.subsets[start..start + entry.size as usize] {
        let mut sum = index_sum;
        for k in 0..hashed_numbers {
            if hashed_subset & (1 << k) != 0 {
                sum += layout.node_problem[8 + k];
            }
        }
        if sum == 0 {
            let final_solution = initial_subset
                | (u128::from(found_index) << (n - node_bits))
                | (u128::from(hashed_subset) << (n - hashed_numbers));
            if final_solution != 0 {
                ctl.put_solution(layout.translate_subset(final_solution, n));
            }
        }
    }
}

/// Hash worker loop: fan out 256 prefixes per packet, probe, verify, emit.
pub fn hash_cpu_worker(
    ctl: &Controller,
    layout: &HashLayout,
    hash: &NodeHash,
    subsums: Option<&SubsumTables>,
) {
    if ctl.numbers().len() <= 16 {
        return;
    }
    let mut popper = DirectPop::new(ctl.mem_queue(), HASH_POP_SPAN);
    let mut found = [0u32; 256];
    let mut nodes_count: u64 = 0;
    let mut last_subset: u128 = 0;

    while let Some(node) = popper.pop() {
        let found_num = match (&hash.lists, subsums) {
            (Some(lists), _) => probe_sums(layout, hash, lists, node.sum, &mut found),
            (None, Some(subsums)) => probe_subsets(layout, hash, subsums, node.sum, &mut found),
            (None, None) => unreachable!("subset mode requires subsum tables"),
        };
        for &index in &found[..found_num] {
            check_and_send_hash(ctl, layout, hash, node.subset_bits(), index);
        }
        nodes_count += 1;
        last_subset = node.subset_bits();
        if nodes_count & 0xfff == 0 {
            ctl.update_progress(nodes_count, last_subset);
            nodes_count = 0;
        }
    }
    ctl.update_progress(nodes_count, last_subset);
}
