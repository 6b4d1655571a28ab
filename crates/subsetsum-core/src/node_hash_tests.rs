use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Error;
use crate::node_hash::{build_node_hash, fold_key, SubsumTables};

fn random_hashed(rng: &mut StdRng, count: usize, magnitude: i64) -> Vec<i128> {
    (0..count)
        .map(|_| {
            let v = rng.gen_range(1..=magnitude);
            i128::from(if rng.gen_bool(0.5) { -v } else { v })
        })
        .collect()
}

/// Direct negated subset sum, the value the tables are defined to produce.
fn reference_sum(hashed: &[i128], subset: u32) -> i64 {
    let mut sum: i64 = 0;
    for (k, &value) in hashed.iter().enumerate() {
        if subset & (1 << k) != 0 {
            sum = sum.wrapping_sub(value as i64);
        }
    }
    sum
}

#[test]
fn subsum_tables_match_direct_sums() {
    let mut rng = StdRng::seed_from_u64(21);
    for &chunk_bits in &[8u32, 9] {
        let hashed = random_hashed(&mut rng, 12, 1_000_000);
        let tables = SubsumTables::new(&hashed, chunk_bits);
        for subset in 0..(1u32 << 12) {
            assert_eq!(tables.sum(subset), reference_sum(&hashed, subset));
        }
    }
}

#[test]
fn fold_key_stays_in_range_and_spreads() {
    let mut rng = StdRng::seed_from_u64(22);
    for _ in 0..1000 {
        let sum: i64 = rng.gen();
        let key = fold_key(sum, 16);
        assert!(key < (1 << 16));
    }
    // keys must depend on the high half, not only the masked low bits
    assert_ne!(fold_key(0, 16), fold_key(1 << 40, 16));
}

#[test]
fn serial_build_buckets_every_subset_exactly_once() {
    let mut rng = StdRng::seed_from_u64(23);
    let hashed = random_hashed(&mut rng, 14, 200);
    let hash_bits = 12u32;
    let subsums = SubsumTables::new(&hashed, 9);
    let hash = build_node_hash(&hashed, hash_bits, false, 1).unwrap();

    assert_eq!(hash.entries.len(), 1 << hash_bits);
    assert_eq!(hash.subsets.len(), 1 << 14);
    let lists = hash.lists.as_ref().unwrap();
    assert_eq!(lists.len(), 1 << 14);

    let mut seen = vec![false; 1 << 14];
    let mut total = 0usize;
    for (key, entry) in hash.entries.iter().enumerate() {
        let start = entry.pos() as usize;
        for (offset, &subset) in hash.subsets[start..start + entry.size as usize]
            .iter()
            .enumerate()
        {
            assert!(!seen[subset as usize], "subset stored twice");
            seen[subset as usize] = true;
            total += 1;
            let sum = subsums.sum(subset);
            assert_eq!(fold_key(sum, hash_bits) as usize, key);
            assert_eq!(lists[start + offset], sum);
        }
    }
    assert_eq!(total, 1 << 14);
    assert!(seen.iter().all(|&s| s));
}

#[test]
fn buckets_preserve_insertion_order() {
    let mut rng = StdRng::seed_from_u64(24);
    let hashed = random_hashed(&mut rng, 12, 40);
    let hash = build_node_hash(&hashed, 6, true, 1).unwrap();
    // with 6 hash bits collisions are guaranteed; each bucket must list its
    // subsets in ascending enumeration order
    let mut collided = false;
    for entry in &hash.entries {
        let start = entry.pos() as usize;
        let bucket = &hash.subsets[start..start + entry.size as usize];
        if bucket.len() > 1 {
            collided = true;
        }
        assert!(bucket.windows(2).all(|w| w[0] < w[1]));
    }
    assert!(collided);
    assert!(hash.lists.is_none());
}

#[test]
fn parallel_build_matches_serial_bit_for_bit() {
    let mut rng = StdRng::seed_from_u64(25);
    // the parallel path requires a suffix wider than 18
    let hashed = random_hashed(&mut rng, 19, 5_000);
    let serial = build_node_hash(&hashed, 20, false, 1).unwrap();
    let parallel = build_node_hash(&hashed, 20, false, 4).unwrap();

    assert_eq!(serial.entries, parallel.entries);
    assert_eq!(serial.subsets, parallel.subsets);
    assert_eq!(serial.lists, parallel.lists);
}

#[test]
fn parallel_build_subset_mode_matches_serial() {
    let mut rng = StdRng::seed_from_u64(26);
    let hashed = random_hashed(&mut rng, 19, 5_000);
    let serial = build_node_hash(&hashed, 20, true, 1).unwrap();
    let parallel = build_node_hash(&hashed, 20, true, 3).unwrap();

    assert_eq!(serial.entries, parallel.entries);
    assert_eq!(serial.subsets, parallel.subsets);
    assert!(serial.lists.is_none() && parallel.lists.is_none());
}

#[test]
fn bucket_overflow_is_reported() {
    // 2^17 subsets into 2 buckets: one side must exceed the 65535 cap
    let mut rng = StdRng::seed_from_u64(27);
    let hashed = random_hashed(&mut rng, 17, 1_000_000);
    match build_node_hash(&hashed, 1, false, 1) {
        Err(Error::HashBucketOverflow) => {}
        other => panic!("expected bucket overflow, got {other:?}"),
    }
}
