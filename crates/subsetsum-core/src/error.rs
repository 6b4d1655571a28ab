//! Error types shared across the engine.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes of the solver.
///
/// Input errors abort the current problem file; resource and accelerator
/// errors are fatal for the whole job.
#[derive(Debug, Error)]
pub enum Error {
    /// The problem file contained no numbers.
    #[error("problem must not be empty")]
    EmptyProblem,

    /// A zero element was found in the input set.
    #[error("set must not have zero elements")]
    ZeroElement,

    /// More than 128 numbers were supplied.
    #[error("problem size must be lower than 129")]
    TooManyNumbers,

    /// The sum of all positive inputs overflows 128 bits.
    #[error("sum of all positive values is out of range")]
    PositiveSumOverflow,

    /// The sum of absolute values of all negative inputs overflows 128 bits.
    #[error("sum of all negative values is out of range")]
    NegativeSumOverflow,

    /// A token in a problem file is not a valid 128-bit decimal integer.
    #[error("parse error: {path}:line {line}: {message}")]
    Parse {
        /// Problem file path.
        path: String,
        /// 1-based line number.
        line: usize,
        /// What was wrong with the token.
        message: String,
    },

    /// A node-hash bucket exceeded 65535 entries; retry with more hash bits.
    #[error("node hash bucket overflow (>65535 entries); raise --hashBits")]
    HashBucketOverflow,

    /// The accelerator cannot hold even the partitioned hash tables.
    #[error("cannot use partitioned hash with more than 16 groups")]
    HashPartitionTooLarge,

    /// No worker was configured to consume work.
    #[error("no workers to solve problem")]
    NoWorkers,

    /// The hash search was started before the node hash was generated.
    #[error("node hash was not generated before the search started")]
    NodeHashMissing,

    /// Device-side failure (pipeline creation, execution or readback).
    #[error("gpu error: {0}")]
    Gpu(String),

    /// Filesystem failure while reading problems or writing solutions.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
