//! End-to-end scenarios: the emitted solution set must equal the brute-force
//! enumeration of non-empty zero-sum subsets, for both methods, with every
//! mask emitted exactly once.

use std::collections::BTreeSet;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use subsetsum_core::{run_search, Controller, Method, Problem, SolverConfig};

/// Incremental-gray brute force over all non-empty subsets.
fn brute_force(numbers: &[i128]) -> BTreeSet<u128> {
    let n = numbers.len();
    assert!(n < 32, "brute force oracle is for small instances");
    let mut out = BTreeSet::new();
    let mut sum: i128 = 0;
    let mut prev: u128 = 0;
    for subset in 1u128..(1u128 << n) {
        let changes = prev ^ subset;
        let mut bit = 1u128;
        let mut bit_num = 0usize;
        while bit & changes != 0 {
            if subset & bit != 0 {
                sum += numbers[bit_num];
            } else {
                sum -= numbers[bit_num];
            }
            bit <<= 1;
            bit_num += 1;
        }
        prev = subset;
        if sum == 0 {
            out.insert(subset);
        }
    }
    out
}

/// Runs the full pipeline and returns every emitted mask, asserting that no
/// mask is emitted twice and that each one verifies in 128-bit arithmetic.
fn run_solver(numbers: &[i128], config: &SolverConfig) -> BTreeSet<u128> {
    let problem = Problem::new(numbers.to_vec()).unwrap();
    let mut controller = match config.method {
        Method::Naive => Controller::new_naive(&problem, config.threads),
        Method::Hash => Controller::new_hash(
            &problem,
            config.threads,
            config.hash_bits,
            config.hashed_numbers,
            config.use_hash_subsets,
        )
        .unwrap(),
    };
    controller.generate_node_hash(config.threads).unwrap();
    let controller = controller;

    let mut emitted = Vec::new();
    std::thread::scope(|scope| {
        let sink = scope.spawn(|| {
            let mut taken = Vec::new();
            while let Some(mask) = controller.get_solution() {
                taken.push(mask);
            }
            taken
        });
        run_search(&controller, config, Vec::new()).unwrap();
        emitted = sink.join().unwrap();
    });

    let set: BTreeSet<u128> = emitted.iter().copied().collect();
    assert_eq!(set.len(), emitted.len(), "a mask was emitted twice");
    for &mask in &set {
        assert!(problem.verify_mask(mask), "mask {mask:b} does not sum to zero");
    }
    assert_eq!(controller.solutions_num(), emitted.len() as u64);
    set
}

fn hash_config(threads: usize) -> SolverConfig {
    SolverConfig {
        method: Method::Hash,
        threads,
        ..SolverConfig::default()
    }
}

fn naive_config(threads: usize) -> SolverConfig {
    SolverConfig {
        method: Method::Naive,
        threads,
        ..SolverConfig::default()
    }
}

#[test]
fn pair_cancels() {
    let numbers = [1i128, -1];
    let expected: BTreeSet<u128> = [0b11u128].into_iter().collect();
    assert_eq!(run_solver(&numbers, &hash_config(2)), expected);
    assert_eq!(run_solver(&numbers, &naive_config(2)), expected);
}

#[test]
fn seven_element_instance_matches_brute_force() {
    let numbers = [1i128, 2, 3, -6, 10, -4, -6];
    let expected = brute_force(&numbers);
    assert!(expected.contains(&0b0001111u128)); // 1+2+3-6
    assert_eq!(run_solver(&numbers, &hash_config(2)), expected);
    assert_eq!(run_solver(&numbers, &naive_config(2)), expected);
}

#[test]
fn duplicate_values_emit_each_pairing_once() {
    // every pairing of a +5 with a -5, plus the full set
    let numbers = [5i128, -5, 5, -5];
    let expected = brute_force(&numbers);
    assert_eq!(
        expected,
        [0b0011u128, 0b0110, 0b1001, 0b1100, 0b1111]
            .into_iter()
            .collect()
    );
    assert_eq!(run_solver(&numbers, &hash_config(2)), expected);
    assert_eq!(run_solver(&numbers, &naive_config(2)), expected);
}

#[test]
fn corpus_instance_22_elements() {
    let numbers: [i128; 22] = [
        -3523805087071,
        -3041114903543,
        -2518887187661,
        -2182934400830,
        -2076288539929,
        -1904107257269,
        -1093340343144,
        -990750566727,
        -353777389662,
        -234393610880,
        795253845080,
        795584841371,
        1060951811712,
        2399454418710,
        2536102847117,
        2750232230939,
        2752129257512,
        2798685196216,
        3431454064293,
        3814474313166,
        3891551143317,
        4353457012691,
    ];
    let expected = brute_force(&numbers);
    assert_eq!(run_solver(&numbers, &hash_config(4)), expected);
}

fn random_instance(seed: u64, len: usize, magnitude: i64) -> Vec<i128> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| {
            let v = rng.gen_range(1..=magnitude);
            i128::from(if rng.gen_bool(0.5) { -v } else { v })
        })
        .collect()
}

#[test]
fn methods_agree_on_random_24_element_instance() {
    let numbers = random_instance(0xFEED, 24, 60);
    let from_hash = run_solver(&numbers, &hash_config(4));
    let from_naive = run_solver(&numbers, &naive_config(4));
    assert_eq!(from_hash, from_naive);
    assert!(!from_hash.is_empty(), "seed should produce solutions");
}

#[test]
fn subset_storage_mode_agrees_with_sum_mode() {
    let numbers = random_instance(0xBEEF, 22, 40);
    let sums = run_solver(&numbers, &hash_config(2));
    let subsets = run_solver(
        &numbers,
        &SolverConfig {
            use_hash_subsets: true,
            ..hash_config(2)
        },
    );
    assert_eq!(sums, subsets);
}

#[test]
fn explicit_hash_parameters_are_honoured() {
    let numbers = random_instance(0xAB, 20, 30);
    let expected = brute_force(&numbers);
    let config = SolverConfig {
        hash_bits: 8,
        hashed_numbers: 6,
        ..hash_config(2)
    };
    assert_eq!(run_solver(&numbers, &config), expected);
}

#[test]
fn rejects_empty_and_zero_inputs() {
    assert!(Problem::new(Vec::new()).is_err());
    assert!(Problem::new(vec![3, 0, -3]).is_err());
}

#[test]
#[ignore = "long: full 32-element equality run"]
fn methods_agree_on_random_32_element_instance() {
    let numbers = random_instance(0xC0FFEE, 32, 200);
    let from_hash = run_solver(&numbers, &hash_config(4));
    let from_naive = run_solver(&numbers, &naive_config(4));
    assert_eq!(from_hash, from_naive);
}

/// Accelerator equality, skipped when no adapter is present.
#[test]
fn gpu_agrees_with_cpu_when_available() {
    let devices = subsetsum_core::select_devices(true, false, false);
    if devices.is_empty() {
        eprintln!("skipping: no accelerator devices");
        return;
    }
    let numbers = random_instance(0xDADA, 22, 40);
    let expected = run_solver(&numbers, &hash_config(2));

    let problem = Problem::new(numbers.clone()).unwrap();
    let config = SolverConfig {
        use_cpu: false,
        ..hash_config(2)
    };
    let mut controller =
        Controller::new_hash(&problem, devices.len(), 0, 0, false).unwrap();
    controller.generate_node_hash(2).unwrap();
    let controller = controller;
    let mut emitted = BTreeSet::new();
    std::thread::scope(|scope| {
        let sink = scope.spawn(|| {
            let mut taken = BTreeSet::new();
            while let Some(mask) = controller.get_solution() {
                taken.insert(mask);
            }
            taken
        });
        run_search(&controller, &config, devices).unwrap();
        emitted = sink.join().unwrap();
    });
    assert_eq!(emitted, expected);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        .. ProptestConfig::default()
    })]

    /// Random instances across the small-problem and split-search paths.
    #[test]
    fn solver_matches_brute_force(
        len in 2usize..=20,
        seed in any::<u64>(),
        magnitude in 1i64..=30,
    ) {
        let numbers = random_instance(seed, len, magnitude);
        let expected = brute_force(&numbers);
        prop_assert_eq!(run_solver(&numbers, &hash_config(2)), expected);
    }
}
