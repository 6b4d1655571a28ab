//! Solver configuration assembled by the caller (normally the CLI).

use crate::kernels::NaiveKernel;

/// Search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Enumerate the whole main region.
    Naive,
    /// Prune the main enumeration with the per-level gate table and resolve
    /// node assignments through the node hash.
    #[default]
    Hash,
}

/// Everything the orchestrator needs to know about one job.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Search strategy (hash by default).
    pub method: Method,
    /// CPU worker count.
    pub threads: usize,
    /// Node hash table bits (0 = derive).
    pub hash_bits: u32,
    /// Hashed suffix width (0 = derive).
    pub hashed_numbers: u32,
    /// Store subset indices instead of 64-bit sums (smaller, slower verify).
    pub use_hash_subsets: bool,
    /// Forced CPU kernel; `None` selects the best detected one.
    pub kernel: Option<NaiveKernel>,
    /// Spawn CPU workers (false when an accelerator-only run was requested).
    pub use_cpu: bool,
    /// Use the grouped accelerator kernel variant.
    pub hash_grouping: bool,
    /// Request a native 64-bit device kernel for the naive method.
    pub use_64bit_device: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: Method::Hash,
            threads: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            hash_bits: 0,
            hashed_numbers: 0,
            use_hash_subsets: false,
            kernel: None,
            use_cpu: true,
            hash_grouping: false,
            use_64bit_device: false,
        }
    }
}
