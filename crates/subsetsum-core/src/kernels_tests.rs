use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::kernels::{detect_kernel, naive_scan_portable, naive_scan_scalar, NaiveKernel};

/// Direct enumeration of the 32 x 512 node space over the 41-entry table.
fn reference_scan(sum_changes: &[i64; 41], input_sum: i64) -> Vec<u32> {
    let mut found = Vec::new();
    for prefix in 0..32u32 {
        let base = input_sum.wrapping_add(sum_changes[prefix as usize]);
        let mut hit = false;
        for suffix in 0..512u32 {
            let mut sum = base;
            for k in 0..9 {
                if suffix & (1 << k) != 0 {
                    sum = sum.wrapping_add(sum_changes[32 + k]);
                }
            }
            if sum == 0 {
                hit = true;
                break;
            }
        }
        if hit {
            found.push(prefix);
        }
    }
    found
}

fn random_table(rng: &mut StdRng) -> [i64; 41] {
    let mut table = [0i64; 41];
    for slot in &mut table {
        // small magnitudes so zero sums actually occur
        *slot = rng.gen_range(-6..=6);
    }
    table
}

#[test]
fn scalar_matches_reference() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut found = [0u32; 64];
    for _ in 0..200 {
        let table = random_table(&mut rng);
        let input = rng.gen_range(-40i64..=40);
        let count = naive_scan_scalar(&table, input, &mut found);
        assert_eq!(&found[..count], reference_scan(&table, input).as_slice());
    }
}

#[test]
fn portable_lanes_match_scalar() {
    let mut rng = StdRng::seed_from_u64(12);
    let mut found_pair = [0u32; 64];
    let mut found_one = [0u32; 64];
    for _ in 0..200 {
        let table = random_table(&mut rng);
        let input1 = rng.gen_range(-40i64..=40);
        let input2 = rng.gen_range(-40i64..=40);
        let pair_count = naive_scan_portable(&table, input1, input2, &mut found_pair);

        let mut expected = Vec::new();
        let count1 = naive_scan_scalar(&table, input1, &mut found_one);
        expected.extend_from_slice(&found_one[..count1]);
        let count2 = naive_scan_scalar(&table, input2, &mut found_one);
        expected.extend(found_one[..count2].iter().map(|i| i + 32));
        let mut got = found_pair[..pair_count].to_vec();
        got.sort_unstable();
        expected.sort_unstable();
        assert_eq!(got, expected);
    }
}

#[cfg(target_arch = "x86_64")]
#[test]
fn x86_kernels_match_portable() {
    use crate::kernels::naive_scan;

    let mut rng = StdRng::seed_from_u64(13);
    let mut expected = [0u32; 64];
    let mut got = [0u32; 64];
    for _ in 0..100 {
        let table = random_table(&mut rng);
        let input1 = rng.gen_range(-40i64..=40);
        let input2 = rng.gen_range(-40i64..=40);
        let expected_count = naive_scan_portable(&table, input1, input2, &mut expected);

        let got_count = naive_scan(NaiveKernel::Sse2, &table, input1, input2, &mut got);
        assert_eq!(&got[..got_count], &expected[..expected_count]);

        if is_x86_feature_detected!("sse4.1") {
            let got_count = naive_scan(NaiveKernel::Sse41, &table, input1, input2, &mut got);
            assert_eq!(&got[..got_count], &expected[..expected_count]);
        }
    }
}

#[test]
fn zero_input_with_zero_free_table_finds_nothing() {
    // all-positive deltas can never cancel a positive input
    let mut table = [1i64; 41];
    for (i, slot) in table.iter_mut().enumerate().take(32) {
        *slot = 1 + i as i64;
    }
    let mut found = [0u32; 64];
    assert_eq!(naive_scan_scalar(&table, 5, &mut found), 0);
}

#[test]
fn detection_is_stable() {
    let first = detect_kernel();
    assert_eq!(first, detect_kernel());
    assert!(first.is_paired() || first == NaiveKernel::Scalar);
}
