//! Problem preprocessing: node/hashed window selection, main-region ordering
//! and the per-level feasibility gates.
//!
//! The node region (enumerated inside workers) is placed over the window of
//! the sorted input with the smallest achievable sum range; the hashed suffix
//! is the smallest-range window inside it. The remaining main region is then
//! ordered outwards from the node window, at each step taking whichever
//! neighbour grows the residual envelope less, and recording the envelope as
//! the gate the partial sum must fall into for a completion to exist.

use crate::error::Result;

/// Feasibility window for the residual partial sum at one main-region level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinMaxStep {
    /// Lowest admissible partial sum.
    pub min_value: i128,
    /// Highest admissible partial sum.
    pub max_value: i128,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NumberEntry {
    number: i128,
    order: u32,
}

/// Sum envelope `(min, max)` reachable by subsets of `numbers`; an all-negative
/// (resp. all-positive) region falls back to its single extreme element so the
/// envelope never degenerates to an empty side.
fn range_for_region(numbers: &[NumberEntry]) -> (i128, i128) {
    let mut min_val: i128 = 0;
    let mut max_val: i128 = 0;
    for entry in numbers {
        if entry.number < 0 {
            min_val += entry.number;
        } else if entry.number > 0 {
            max_val += entry.number;
        }
    }
    if min_val == 0 {
        min_val = numbers[0].number;
    }
    if max_val == 0 {
        max_val = numbers[numbers.len() - 1].number;
    }
    (min_val, max_val)
}

/// Slides a window of `region_size` over the sorted entries and returns the
/// start of the window with the smallest sum range. O(n): both envelope ends
/// are maintained incrementally as elements enter and leave. Ties resolve to
/// the lowest index.
fn smallest_range_region(numbers: &[NumberEntry], region_size: usize) -> usize {
    let numbers_num = numbers.len();
    let mut min_val: i128 = 0;
    let mut max_val: i128 = 0;
    for entry in &numbers[..region_size] {
        if entry.number < 0 {
            min_val += entry.number;
        } else if entry.number > 0 {
            max_val += entry.number;
        }
    }
    if min_val == 0 {
        min_val = numbers[0].number;
    }
    if max_val == 0 {
        max_val = numbers[region_size - 1].number;
    }

    let mut best_range = max_val - min_val;
    let mut best_pos = 0usize;
    for pos in 1..numbers_num - region_size {
        if numbers[pos - 1].number < 0 {
            min_val -= numbers[pos - 1].number;
        }
        if min_val >= 0 {
            min_val = numbers[pos].number;
        }

        if numbers[pos + region_size - 1].number > 0 {
            if max_val > 0 {
                max_val += numbers[pos + region_size - 1].number;
            }
        } else if min_val < 0 {
            min_val += numbers[pos + region_size - 1].number;
        }

        if max_val < 0 {
            max_val = numbers[pos + region_size - 1].number;
        } else if numbers[pos - 1].number > 0 {
            max_val -= numbers[pos - 1].number;
        }

        let range = max_val - min_val;
        if range < best_range {
            best_pos = pos;
            best_range = range;
        }
    }
    best_pos
}

/// Orders the main region by a two-ended merge starting just outside the node
/// window, preferring at each level the neighbour that widens the residual
/// envelope less, and writes `gates[k] = (-max, -min)` of the envelope before
/// level `k` is placed.
fn order_number_ranges(
    start_left: isize,
    start_right: usize,
    numbers: &[NumberEntry],
    dest_numbers: &mut Vec<i128>,
    dest_orders: &mut Vec<u32>,
    dest_min_max: &mut Vec<MinMaxStep>,
) {
    let numbers_num = numbers.len();
    let mut left = start_left;
    let mut right = start_right;

    let window = &numbers[(start_left + 1) as usize..start_right];
    let (mut min_val, mut max_val) = range_for_region(window);

    while left >= 0 || right < numbers_num {
        dest_min_max.push(MinMaxStep {
            min_value: -max_val,
            max_value: -min_val,
        });

        if left >= 0 && right < numbers_num {
            let lnum = numbers[left as usize].number;
            let rnum = numbers[right].number;

            let mut new_min1 = min_val;
            let mut new_max1 = max_val;
            if new_min1 > 0 {
                new_min1 = lnum;
            } else {
                new_min1 += lnum;
            }
            if new_max1 > 0 && lnum > 0 {
                new_max1 += lnum;
            }

            let mut new_min2 = min_val;
            let mut new_max2 = max_val;
            if new_max2 < 0 {
                new_max2 = rnum;
            } else {
                new_max2 += rnum;
            }
            if new_min2 < 0 && rnum < 0 {
                new_min2 += rnum;
            }

            if new_max1 - new_min1 < new_max2 - new_min2 {
                dest_numbers.push(lnum);
                dest_orders.push(numbers[left as usize].order);
                left -= 1;
                min_val = new_min1;
                max_val = new_max1;
            } else {
                dest_numbers.push(rnum);
                dest_orders.push(numbers[right].order);
                right += 1;
                min_val = new_min2;
                max_val = new_max2;
            }
        } else if left >= 0 {
            let lnum = numbers[left as usize].number;
            if min_val > 0 {
                min_val = lnum;
            } else {
                min_val += lnum;
            }
            if lnum > 0 && max_val > 0 {
                max_val += lnum;
            }
            dest_numbers.push(lnum);
            dest_orders.push(numbers[left as usize].order);
            left -= 1;
        } else {
            let rnum = numbers[right].number;
            if max_val < 0 {
                max_val = rnum;
            } else {
                max_val += rnum;
            }
            if rnum < 0 && min_val < 0 {
                min_val += rnum;
            }
            dest_numbers.push(rnum);
            dest_orders.push(numbers[right].order);
            right += 1;
        }
    }
}

/// Resolves the `(hash_bits, hashed_numbers)` pair: defaults, mutual
/// derivation and the `hashed_numbers <= n - 10` clamp.
#[must_use]
pub fn resolve_hash_params(n: usize, hash_bits: u32, hashed_numbers: u32) -> (u32, u32) {
    let mut h = hash_bits;
    let mut m = hashed_numbers;
    if m == 0 && h != 0 {
        m = if h >= 3 { h - 2 } else { 1 };
    } else if m != 0 && h == 0 {
        if m + 8 > n as u32 - 1 {
            m = n as u32 - 10;
        }
        h = m + 2;
    } else if m == 0 && h == 0 {
        h = 20;
        m = 18;
    }
    if m + 8 > n as u32 - 1 {
        m = n as u32 - 10;
    }
    (h, m)
}

/// Preprocessor output for the hash method: reordered regions, reorder
/// tables, the per-level gate table and the 256-entry SIMD-prefix deltas.
#[derive(Debug)]
pub struct HashLayout {
    /// Node hash table bits.
    pub node_hash_bits: u32,
    /// Width of the hashed suffix.
    pub node_hashed_numbers: u32,
    /// Node region width: `8 + node_hashed_numbers`.
    pub node_bits: u32,
    /// Main-region values in enumeration order.
    pub main_problem: Vec<i128>,
    /// Original index of each main-region slot.
    pub main_trans: Vec<u32>,
    /// Node-region values: SIMD prefix, unhashed remainder, hashed suffix.
    pub node_problem: Vec<i128>,
    /// Original index of each node-region slot.
    pub node_trans: Vec<u32>,
    /// Per-level feasibility gates for the main enumeration.
    pub min_max: Vec<MinMaxStep>,
    /// 64-bit sum of every subset of the 8 SIMD-prefix slots.
    pub sum_changes: Box<[i64; 256]>,
}

impl HashLayout {
    /// Builds the layout for a problem of more than 16 numbers.
    ///
    /// # Errors
    ///
    /// Currently infallible beyond the validation already performed on the
    /// input; kept fallible for parity with the node-hash build step.
    pub fn build(numbers: &[i128], hash_bits: u32, hashed_numbers: u32) -> Result<Self> {
        let n = numbers.len();
        debug_assert!(n > 16);
        let (node_hash_bits, node_hashed_numbers) =
            resolve_hash_params(n, hash_bits, hashed_numbers);
        let node_bits = 8 + node_hashed_numbers;

        tracing::info!(
            bits = node_hash_bits,
            hashed = node_hashed_numbers,
            "node hash parameters"
        );

        let mut entries: Vec<NumberEntry> = numbers
            .iter()
            .enumerate()
            .map(|(order, &number)| NumberEntry {
                number,
                order: order as u32,
            })
            .collect();
        entries.sort();

        let node_pos = smallest_range_region(&entries, node_bits as usize);
        let hashed_pos = smallest_range_region(
            &entries[node_pos..node_pos + node_bits as usize],
            node_hashed_numbers as usize,
        ) + node_pos;

        let mut node_problem = Vec::with_capacity(node_bits as usize);
        let mut node_trans = Vec::with_capacity(node_bits as usize);
        for entry in &entries[node_pos..hashed_pos] {
            node_problem.push(entry.number);
            node_trans.push(entry.order);
        }
        for entry in &entries[hashed_pos + node_hashed_numbers as usize..node_pos + node_bits as usize]
        {
            node_problem.push(entry.number);
            node_trans.push(entry.order);
        }
        // hashed window goes last
        for entry in &entries[hashed_pos..hashed_pos + node_hashed_numbers as usize] {
            node_problem.push(entry.number);
            node_trans.push(entry.order);
        }

        let mut sum_changes = Box::new([0i64; 256]);
        for (i, slot) in sum_changes.iter_mut().enumerate() {
            let mut sum: i64 = 0;
            for (x, &value) in node_problem.iter().take(8).enumerate() {
                if i & (1 << x) != 0 {
                    sum = sum.wrapping_add(value as i64);
                }
            }
            *slot = sum;
        }

        let mut main_problem = Vec::with_capacity(n - node_bits as usize);
        let mut main_trans = Vec::with_capacity(n - node_bits as usize);
        let mut min_max = Vec::with_capacity(n - node_bits as usize);
        order_number_ranges(
            node_pos as isize - 1,
            node_pos + node_bits as usize,
            &entries,
            &mut main_problem,
            &mut main_trans,
            &mut min_max,
        );

        Ok(Self {
            node_hash_bits,
            node_hashed_numbers,
            node_bits,
            main_problem,
            main_trans,
            node_problem,
            node_trans,
            min_max,
            sum_changes,
        })
    }

    /// Maps a bitmask in the reordered numbering back to the original input
    /// numbering.
    #[must_use]
    pub fn translate_subset(&self, subset: u128, n: usize) -> u128 {
        let main_count = n - self.node_bits as usize;
        let mut out: u128 = 0;
        for (i, &orig) in self.main_trans.iter().enumerate().take(main_count) {
            if subset & (1u128 << i) != 0 {
                out |= 1u128 << orig;
            }
        }
        for (i, &orig) in self.node_trans.iter().enumerate() {
            if subset & (1u128 << (main_count + i)) != 0 {
                out |= 1u128 << orig;
            }
        }
        out
    }
}

/// Tables owned by the naive method: 32 sums over the 5-bit prefix of the
/// node extension plus the 9 tail values. This is a distinct table from
/// [`HashLayout::sum_changes`]; the two never share storage.
#[derive(Debug)]
pub struct NaiveTables {
    /// `[0..32)`: prefix sums; `[32..41)`: the last nine input values.
    pub sum_changes: Box<[i64; 41]>,
}

impl NaiveTables {
    /// Builds the table for a problem of more than 16 numbers. The naive
    /// method keeps the original input order: the node region is simply the
    /// last 14 elements.
    #[must_use]
    pub fn build(numbers: &[i128]) -> Self {
        let n = numbers.len();
        debug_assert!(n > 16);
        let mut sum_changes = Box::new([0i64; 41]);
        for i in 0..32usize {
            let mut sum: i64 = 0;
            for x in 0..5 {
                if i & (1 << x) != 0 {
                    sum = sum.wrapping_add(numbers[n - 14 + x] as i64);
                }
            }
            sum_changes[i] = sum;
        }
        for i in 0..9 {
            sum_changes[32 + i] = numbers[n - 9 + i] as i64;
        }
        Self { sum_changes }
    }
}

