use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::direct::DirectPop;
use crate::preprocess::{resolve_hash_params, HashLayout};
use crate::producer::{generate_hash, NodeSubset};
use crate::ring::SpanQueue;

#[test]
fn hash_params_default_and_derive() {
    assert_eq!(resolve_hash_params(40, 0, 0), (20, 18));
    // clamp to n - 10
    assert_eq!(resolve_hash_params(22, 0, 0), (20, 12));
    // derive the suffix from the bits
    assert_eq!(resolve_hash_params(40, 10, 0), (10, 8));
    assert_eq!(resolve_hash_params(40, 2, 0), (2, 1));
    // derive the bits from the suffix
    assert_eq!(resolve_hash_params(40, 0, 12), (14, 12));
    assert_eq!(resolve_hash_params(21, 0, 18), (13, 11));
}

fn layout_for(numbers: &[i128], hash_bits: u32, hashed: u32) -> HashLayout {
    HashLayout::build(numbers, hash_bits, hashed).unwrap()
}

#[test]
fn layout_is_a_permutation_of_the_input() {
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..20 {
        let numbers: Vec<i128> = (0..24)
            .map(|_| {
                let v: i64 = rng.gen_range(-1_000_000..=1_000_000);
                if v == 0 {
                    1
                } else {
                    i128::from(v)
                }
            })
            .collect();
        let layout = layout_for(&numbers, 0, 0);
        let n = numbers.len();
        assert_eq!(layout.node_bits, 8 + layout.node_hashed_numbers);
        assert_eq!(layout.node_problem.len(), layout.node_bits as usize);
        assert_eq!(
            layout.main_problem.len(),
            n - layout.node_bits as usize
        );

        let mut seen = vec![false; n];
        for (&value, &orig) in layout.main_problem.iter().zip(&layout.main_trans) {
            assert_eq!(value, numbers[orig as usize]);
            assert!(!seen[orig as usize]);
            seen[orig as usize] = true;
        }
        for (&value, &orig) in layout.node_problem.iter().zip(&layout.node_trans) {
            assert_eq!(value, numbers[orig as usize]);
            assert!(!seen[orig as usize]);
            seen[orig as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}

#[test]
fn gate_table_is_ordered() {
    let mut rng = StdRng::seed_from_u64(6);
    let numbers: Vec<i128> = (0..30)
        .map(|_| i128::from(rng.gen_range(1..=1000i64)) * if rng.gen_bool(0.5) { -1 } else { 1 })
        .collect();
    let layout = layout_for(&numbers, 0, 0);
    for step in &layout.min_max {
        assert!(step.min_value <= step.max_value);
    }
}

#[test]
fn sum_changes_cover_all_prefix_subsets() {
    let mut rng = StdRng::seed_from_u64(7);
    let numbers: Vec<i128> = (0..26)
        .map(|_| i128::from(rng.gen_range(1..=500i64)) * if rng.gen_bool(0.5) { -1 } else { 1 })
        .collect();
    let layout = layout_for(&numbers, 0, 0);
    for i in 0..256usize {
        let mut expected: i64 = 0;
        for x in 0..8 {
            if i & (1 << x) != 0 {
                expected = expected.wrapping_add(layout.node_problem[x] as i64);
            }
        }
        assert_eq!(layout.sum_changes[i], expected);
    }
}

#[test]
fn translate_subset_maps_reordered_bits_to_original_indices() {
    let mut rng = StdRng::seed_from_u64(8);
    let numbers: Vec<i128> = (0..20)
        .map(|_| i128::from(rng.gen_range(1..=100i64)) * if rng.gen_bool(0.5) { -1 } else { 1 })
        .collect();
    let layout = layout_for(&numbers, 6, 4);
    let n = numbers.len();
    let main_count = n - layout.node_bits as usize;
    for _ in 0..100 {
        let mask: u128 = rng.gen::<u64>() as u128 & ((1u128 << n) - 1);
        let translated = layout.translate_subset(mask, n);
        // the sums over both numberings must agree
        let mut reordered_sum: i128 = 0;
        for i in 0..main_count {
            if mask & (1u128 << i) != 0 {
                reordered_sum += layout.main_problem[i];
            }
        }
        for i in 0..layout.node_bits as usize {
            if mask & (1u128 << (main_count + i)) != 0 {
                reordered_sum += layout.node_problem[i];
            }
        }
        let mut original_sum: i128 = 0;
        for (i, &value) in numbers.iter().enumerate() {
            if translated & (1u128 << i) != 0 {
                original_sum += value;
            }
        }
        assert_eq!(reordered_sum, original_sum);
        assert_eq!(mask.count_ones(), translated.count_ones());
    }
}

/// Invariant: the gate-pruned producer never skips a main assignment that
/// admits a zero-sum completion over the node region.
#[test]
fn gates_never_prune_completable_assignments() {
    let mut rng = StdRng::seed_from_u64(9);
    for round in 0..5 {
        let numbers: Vec<i128> = (0..20)
            .map(|_| i128::from(rng.gen_range(1..=12i64)) * if rng.gen_bool(0.5) { -1 } else { 1 })
            .collect();
        // small hashed suffix so the main region stays enumerable
        let layout = layout_for(&numbers, 6, 4);
        let n = numbers.len();
        let main_count = n - layout.node_bits as usize;

        let queue: SpanQueue<NodeSubset> = SpanQueue::new(4 << main_count, 4, 4);
        generate_hash(&layout, &queue);
        queue.close();
        let mut emitted = std::collections::BTreeSet::new();
        let mut popper = DirectPop::new(&queue, 64);
        while let Some(node) = popper.pop() {
            emitted.insert(node.subset_bits());
        }

        for main_mask in 0u128..(1u128 << main_count) {
            let mut main_sum: i128 = 0;
            for i in 0..main_count {
                if main_mask & (1u128 << i) != 0 {
                    main_sum += layout.main_problem[i];
                }
            }
            let mut completable = false;
            for node_mask in 0u64..(1u64 << layout.node_bits) {
                let mut sum = main_sum;
                for i in 0..layout.node_bits as usize {
                    if node_mask & (1u64 << i) != 0 {
                        sum += layout.node_problem[i];
                    }
                }
                if sum == 0 && (main_mask != 0 || node_mask != 0) {
                    completable = true;
                    break;
                }
            }
            if completable {
                assert!(
                    emitted.contains(&main_mask),
                    "round {round}: completable assignment {main_mask:b} was pruned"
                );
            }
        }
    }
}
