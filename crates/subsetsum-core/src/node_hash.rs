//! Reverse lookup from residual sums of the hashed suffix to the subsets
//! that achieve them.
//!
//! The builder enumerates every assignment of the hashed suffix, buckets it
//! by a folded hash of its (negated) 64-bit residual, and lays the buckets
//! out contiguously in bucket-id order. With one thread (or a small suffix)
//! this runs serially; otherwise a three-phase scatter → compact → fill
//! pipeline with a condvar barrier between phases spreads the work over
//! short-lived workers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// End-of-chain marker in the scratch linked list.
const LIST_END: u32 = u32::MAX;

/// Scratch blocks are claimed from an atomic counter in slices of this size.
const PUT_SUBSET_BLOCK_SIZE: u32 = 4096;

/// Folding hash shared by the builder, the CPU workers and the GPU kernels.
/// The chain deliberately narrows to 32 bits after the first shift; all
/// probers must match it bit for bit or the table is unusable.
#[inline]
#[must_use]
pub fn fold_key(sum: i64, hash_bits: u32) -> u32 {
    let hmask = (1u32 << hash_bits) - 1;
    let temph1 = (sum >> hash_bits) as u32;
    let temph2 = temph1 >> hash_bits;
    let temph3 = temph2 >> hash_bits;
    let temph4 = temph3 >> hash_bits;
    ((sum as u32) ^ temph1 ^ temph2 ^ temph3 ^ temph4) & hmask
}

/// One bucket head: a 48-bit `(pos, size)` record. `pos` indexes the
/// linearised subset/list arrays; `size` is the bucket length, capped at
/// 65535.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NodeHashEntry {
    pos_lo: u16,
    pos_hi: u16,
    /// Bucket length.
    pub size: u16,
}

impl NodeHashEntry {
    /// Byte/element position of the bucket in the linearised arrays.
    #[inline]
    #[must_use]
    pub fn pos(&self) -> u32 {
        (u32::from(self.pos_hi) << 16) | u32::from(self.pos_lo)
    }

    #[inline]
    fn set_pos(&mut self, pos: u32) {
        self.pos_lo = pos as u16;
        self.pos_hi = (pos >> 16) as u16;
    }
}

/// Per-chunk partial-sum tables over the hashed suffix.
///
/// The suffix is cut into chunks of `chunk_bits` slots; each chunk gets a
/// `2^chunk_bits`-entry table of *negated* partial sums, built by a Gray-code
/// sweep so consecutive entries differ by one addition or subtraction. The
/// residual of a full suffix assignment is the sum of one lookup per chunk.
/// The builder uses 9-bit chunks (≤4 tables for suffixes up to 36); the
/// subset-mode workers and the GPU use an 8-bit layout.
#[derive(Debug)]
pub struct SubsumTables {
    tables: Vec<i64>,
    chunk_bits: u32,
    chunks: u32,
    width: u32,
}

impl SubsumTables {
    /// Builds tables for `hashed` (the hashed-suffix values) with the given
    /// chunk width.
    #[must_use]
    pub fn new(hashed: &[i128], chunk_bits: u32) -> Self {
        let m = hashed.len() as u32;
        let chunks = (m + chunk_bits - 1) / chunk_bits;
        let width = 1u32 << chunk_bits;
        let mut tables = vec![0i64; (chunks * width) as usize];
        for t in 0..chunks {
            let number_pos = t * chunk_bits;
            let chunk_len = chunk_bits.min(m - number_pos);
            let subsum_size = 1u32 << chunk_len;

            let mut prev_subset = 0u32;
            let mut sum: i64 = 0;
            for subset in 0..subsum_size {
                let changes = prev_subset ^ subset;
                let mut bit = 1u32;
                let mut bit_num = 0;
                while bit & changes != 0 && bit_num < chunk_len {
                    let value = hashed[(number_pos + bit_num) as usize] as i64;
                    if subset & bit != 0 {
                        sum = sum.wrapping_sub(value);
                    } else {
                        sum = sum.wrapping_add(value);
                    }
                    bit <<= 1;
                    bit_num += 1;
                }
                prev_subset = subset;
                tables[(width * t + subset) as usize] = sum;
            }
        }
        Self {
            tables,
            chunk_bits,
            chunks,
            width,
        }
    }

    /// Negated residual of one suffix assignment: 1–4 table lookups.
    #[inline]
    #[must_use]
    pub fn sum(&self, subset: u32) -> i64 {
        let mask = self.width - 1;
        let mut acc = self.tables[(subset & mask) as usize];
        for t in 1..self.chunks {
            let part = (subset >> (t * self.chunk_bits)) & mask;
            acc = acc.wrapping_add(self.tables[(self.width * t + part) as usize]);
        }
        acc
    }

    /// Raw table storage (uploaded to the accelerator).
    #[must_use]
    pub fn raw(&self) -> &[i64] {
        &self.tables
    }

    /// Number of chunks.
    #[must_use]
    pub fn chunks(&self) -> u32 {
        self.chunks
    }
}

/// The built node hash: bucket heads plus the linearised bucket contents.
#[derive(Debug)]
pub struct NodeHash {
    /// `2^hash_bits` bucket heads.
    pub entries: Vec<NodeHashEntry>,
    /// `2^hashed_numbers` suffix indices, bucket by bucket.
    pub subsets: Vec<u32>,
    /// Parallel 64-bit residuals; absent in subset-only mode.
    pub lists: Option<Vec<i64>>,
}

struct TmpListEntry {
    subset: u32,
    next: u32,
}

#[derive(Clone, Copy, Default)]
struct BlockInfo {
    pos: u32,
    size: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scatter,
    Compact,
    Fill,
    Abort,
}

/// Chains `subset` into the bucket for `hkey`, storing the link at absolute
/// scratch slot `slot`. Returns false on bucket overflow.
#[inline]
fn chain_subset(
    entry: &mut NodeHashEntry,
    tmp_slot: &mut TmpListEntry,
    subset: u32,
    slot: u32,
) -> bool {
    if entry.size == 0 {
        entry.set_pos(slot);
        entry.size = 1;
        tmp_slot.next = LIST_END;
        tmp_slot.subset = subset;
    } else {
        if entry.size == u16::MAX {
            return false;
        }
        let next = entry.pos();
        entry.size += 1;
        entry.set_pos(slot);
        tmp_slot.next = next;
        tmp_slot.subset = subset;
    }
    true
}

/// Builds the node hash over the hashed suffix values.
///
/// # Errors
///
/// Returns [`Error::HashBucketOverflow`] when any bucket would exceed 65535
/// entries; the caller should retry with more hash bits.
pub fn build_node_hash(
    hashed: &[i128],
    hash_bits: u32,
    use_subsets: bool,
    threads: usize,
) -> Result<NodeHash> {
    let hashed_numbers = hashed.len() as u32;
    let subsums = SubsumTables::new(hashed, 9);
    if threads <= 1 || hashed_numbers < 20 {
        build_serial(&subsums, hashed_numbers, hash_bits, use_subsets)
    } else {
        tracing::info!(threads, "using parallel node hash build");
        build_parallel(&subsums, hashed_numbers, hash_bits, use_subsets, threads)
    }
}

fn build_serial(
    subsums: &SubsumTables,
    hashed_numbers: u32,
    hash_bits: u32,
    use_subsets: bool,
) -> Result<NodeHash> {
    let hashed_subsets = 1u32 << hashed_numbers;
    let hash_size = 1usize << hash_bits;

    let mut entries = vec![NodeHashEntry::default(); hash_size];
    let mut tmp: Vec<TmpListEntry> = Vec::with_capacity(hashed_subsets as usize);

    for subset in 0..hashed_subsets {
        let sum = subsums.sum(subset);
        let hkey = fold_key(sum, hash_bits) as usize;
        let slot = tmp.len() as u32;
        tmp.push(TmpListEntry {
            subset: 0,
            next: LIST_END,
        });
        if !chain_subset(&mut entries[hkey], &mut tmp[slot as usize], subset, slot) {
            return Err(Error::HashBucketOverflow);
        }
    }

    // linearise: drain each chain in reverse to restore insertion order
    let mut subsets = vec![0u32; hashed_subsets as usize];
    let mut list_pos = 0u32;
    for entry in &mut entries {
        if entry.size == 0 {
            continue;
        }
        let mut current = entry.pos();
        for k in (0..entry.size as u32).rev() {
            subsets[(list_pos + k) as usize] = tmp[current as usize].subset;
            current = tmp[current as usize].next;
        }
        entry.set_pos(list_pos);
        list_pos += u32::from(entry.size);
    }
    drop(tmp);

    let lists = if use_subsets {
        None
    } else {
        Some(subsets.iter().map(|&s| subsums.sum(s)).collect())
    };

    Ok(NodeHash {
        entries,
        subsets,
        lists,
    })
}

/// Pointer bundle handed to the phase workers. Each phase writes disjoint
/// regions: scatter shards buckets by the top hash bit and claims scratch
/// blocks atomically, compact claims whole hash-blocks, fill claims subset
/// ranges.
struct BuildShared {
    entries: *mut NodeHashEntry,
    tmp: *mut TmpListEntry,
    subsets: *mut u32,
    lists: *mut i64,
    blocks: *mut BlockInfo,
}

// SAFETY: the phases are barrier-separated and partition their writes as
// described above; reads only target data completed in an earlier phase.
unsafe impl Sync for BuildShared {}

struct BuildSync {
    phase: Mutex<PhaseState>,
    cond: Condvar,
    scatter_part: AtomicU32,
    compact_part: AtomicU32,
    fill_part: AtomicU32,
    block_count: AtomicU32,
    overflow: AtomicBool,
}

struct PhaseState {
    phase: Phase,
    scatter_left: u32,
    compact_left: u32,
}

#[allow(clippy::too_many_lines)]
fn build_parallel(
    subsums: &SubsumTables,
    hashed_numbers: u32,
    hash_bits: u32,
    use_subsets: bool,
    threads: usize,
) -> Result<NodeHash> {
    assert!(hashed_numbers > 18, "parallel build needs a wide suffix");
    let hashed_subsets = 1u32 << hashed_numbers;
    let hash_size = 1usize << hash_bits;

    let mut thread_bits = 0u32;
    let mut v = 1usize;
    while v < threads {
        v <<= 1;
        thread_bits += 1;
    }
    let subset_part_bits = hashed_numbers.min(thread_bits + 4);
    let hash_part_bits = hash_bits.min(thread_bits + 4);
    let hash_parts = 1u32 << hash_part_bits;

    let mut entries = vec![NodeHashEntry::default(); hash_size];
    let mut tmp: Vec<TmpListEntry> = (0..hashed_subsets + 2 * PUT_SUBSET_BLOCK_SIZE)
        .map(|_| TmpListEntry {
            subset: 0,
            next: LIST_END,
        })
        .collect();
    let mut subsets = vec![0u32; hashed_subsets as usize];
    let mut lists = if use_subsets {
        Vec::new()
    } else {
        vec![0i64; hashed_subsets as usize]
    };
    let mut blocks = vec![BlockInfo::default(); hash_parts as usize];

    let shared = BuildShared {
        entries: entries.as_mut_ptr(),
        tmp: tmp.as_mut_ptr(),
        subsets: subsets.as_mut_ptr(),
        lists: lists.as_mut_ptr(),
        blocks: blocks.as_mut_ptr(),
    };
    let sync = BuildSync {
        phase: Mutex::new(PhaseState {
            phase: Phase::Scatter,
            scatter_left: threads as u32,
            compact_left: threads as u32,
        }),
        cond: Condvar::new(),
        scatter_part: AtomicU32::new(0),
        compact_part: AtomicU32::new(0),
        fill_part: AtomicU32::new(0),
        block_count: AtomicU32::new(0),
        overflow: AtomicBool::new(false),
    };

    std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                build_worker(
                    subsums,
                    &shared,
                    &sync,
                    hashed_numbers,
                    hash_bits,
                    hash_part_bits,
                    subset_part_bits,
                    use_subsets,
                );
            });
        }

        // barrier: wait for the scatter phase to drain
        {
            let mut state = sync.phase.lock();
            while state.scatter_left != 0 {
                sync.cond.wait(&mut state);
            }
            if sync.overflow.load(Ordering::Acquire) {
                state.phase = Phase::Abort;
                sync.cond.notify_all();
                return;
            }
            // prefix-sum per-hash-block sizes into the final layout; done
            // through the shared pointer so the workers' later reads keep
            // the same provenance
            let mut list_pos = 0u32;
            for i in 0..hash_parts as usize {
                // SAFETY: scatter workers are past the barrier; nothing else
                // touches the block table until Compact is announced.
                unsafe {
                    let block = &mut *shared.blocks.add(i);
                    block.pos = list_pos;
                    list_pos += block.size;
                }
            }
            state.phase = Phase::Compact;
            sync.cond.notify_all();

            while state.compact_left != 0 {
                sync.cond.wait(&mut state);
            }
            if !use_subsets {
                state.phase = Phase::Fill;
                sync.cond.notify_all();
            }
        }
    });

    if sync.overflow.load(Ordering::Acquire) {
        return Err(Error::HashBucketOverflow);
    }
    drop(tmp);
    Ok(NodeHash {
        entries,
        subsets,
        lists: if use_subsets { None } else { Some(lists) },
    })
}

#[allow(clippy::too_many_arguments)]
fn build_worker(
    subsums: &SubsumTables,
    shared: &BuildShared,
    sync: &BuildSync,
    hashed_numbers: u32,
    hash_bits: u32,
    hash_part_bits: u32,
    subset_part_bits: u32,
    use_subsets: bool,
) {
    let hashed_subsets = 1u32 << hashed_numbers;
    let hash_parts = 1u32 << hash_part_bits;
    let subset_parts = 1u32 << subset_part_bits;

    // scatter phase: the subset space is processed by two shard owners keyed
    // on the top hash bit; everyone else skips straight to the barrier
    let scatter_part = sync.scatter_part.fetch_add(1, Ordering::AcqRel);
    if scatter_part < 2 {
        let half_blocks = (hash_parts >> 1) as usize;
        let mut block_sizes = vec![0u32; half_blocks];
        let block_id_shift = hash_bits - hash_part_bits;
        let block_id_mask = (1u32 << (hash_part_bits - 1)) - 1;

        let mut lp = sync
            .block_count
            .fetch_add(PUT_SUBSET_BLOCK_SIZE, Ordering::AcqRel);
        let mut lpx = 0u32;
        'scatter: for subset in 0..hashed_subsets {
            let sum = subsums.sum(subset);
            let hkey = fold_key(sum, hash_bits);
            if hkey >> (hash_bits - 1) != scatter_part {
                continue;
            }
            if lpx == PUT_SUBSET_BLOCK_SIZE {
                lp = sync
                    .block_count
                    .fetch_add(PUT_SUBSET_BLOCK_SIZE, Ordering::AcqRel);
                lpx = 0;
            }
            block_sizes[((hkey >> block_id_shift) & block_id_mask) as usize] += 1;
            let slot = lp + lpx;
            // SAFETY: `hkey` belongs to this worker's shard and `slot` lies
            // in a scratch block claimed from the atomic counter.
            let ok = unsafe {
                chain_subset(
                    &mut *shared.entries.add(hkey as usize),
                    &mut *shared.tmp.add(slot as usize),
                    subset,
                    slot,
                )
            };
            if !ok {
                sync.overflow.store(true, Ordering::Release);
                break 'scatter;
            }
            lpx += 1;
        }

        let shift = scatter_part * (1u32 << (hash_part_bits - 1));
        for (i, &size) in block_sizes.iter().enumerate() {
            // SAFETY: each shard owns one half of the block table.
            unsafe { (*shared.blocks.add((shift as usize) + i)).size = size };
        }
    }

    {
        let mut state = sync.phase.lock();
        state.scatter_left -= 1;
        if state.scatter_left == 0 {
            sync.cond.notify_all();
        }
        while state.phase == Phase::Scatter {
            sync.cond.wait(&mut state);
        }
        if state.phase == Phase::Abort {
            state.compact_left -= 1;
            if state.compact_left == 0 {
                sync.cond.notify_all();
            }
            return;
        }
    }

    // compact phase: claim hash-blocks, linearise their scratch chains
    let mut compact_part = sync.compact_part.fetch_add(1, Ordering::AcqRel);
    while compact_part < hash_parts {
        let hash_start = (compact_part as usize) << (hash_bits - hash_part_bits);
        let hash_end = ((compact_part + 1) as usize) << (hash_bits - hash_part_bits);
        // SAFETY: this worker claimed hash block `compact_part`; the entries
        // and the subset span starting at the block's prefix-summed position
        // belong to it alone, and the scratch list is read-only now.
        let mut list_pos = unsafe { (*shared.blocks.add(compact_part as usize)).pos };
        for i in hash_start..hash_end {
            unsafe {
                let entry = &mut *shared.entries.add(i);
                if entry.size == 0 {
                    continue;
                }
                let mut current = entry.pos();
                for k in (0..u32::from(entry.size)).rev() {
                    *shared.subsets.add((list_pos + k) as usize) =
                        (*shared.tmp.add(current as usize)).subset;
                    current = (*shared.tmp.add(current as usize)).next;
                }
                entry.set_pos(list_pos);
                list_pos += u32::from(entry.size);
            }
        }
        compact_part = sync.compact_part.fetch_add(1, Ordering::AcqRel);
    }

    {
        let mut state = sync.phase.lock();
        state.compact_left -= 1;
        if state.compact_left == 0 {
            sync.cond.notify_all();
        }
        if use_subsets {
            return;
        }
        while state.phase == Phase::Compact {
            sync.cond.wait(&mut state);
        }
        if state.phase == Phase::Abort {
            return;
        }
    }

    // fill phase: claim subset partitions, recompute each stored residual
    let mut fill_part = sync.fill_part.fetch_add(1, Ordering::AcqRel);
    while fill_part < subset_parts {
        let start = (fill_part as usize) << (hashed_numbers - subset_part_bits);
        let end = ((fill_part + 1) as usize) << (hashed_numbers - subset_part_bits);
        for i in start..end {
            // SAFETY: fill partitions are disjoint; `subsets` is complete
            // after the compact barrier.
            unsafe {
                let subset = *shared.subsets.add(i);
                *shared.lists.add(i) = subsums.sum(subset);
            }
        }
        fill_part = sync.fill_part.fetch_add(1, Ordering::AcqRel);
    }
}
