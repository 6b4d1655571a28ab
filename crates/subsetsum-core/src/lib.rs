//! # SubsetSum Core
//!
//! Heterogeneous search engine finding every non-empty subset of a signed
//! 128-bit multiset that sums to zero.
//!
//! The search space is split meet-in-the-middle: a single producer unfolds
//! the *main* region into work packets while CPU (scalar / SIMD) and GPU
//! workers enumerate the *node* region per packet, probing a precomputed
//! reverse hash over the hashed suffix. Packets travel through a
//! span-reservation MPMC ring; solutions drain through a single bounded
//! sink queue.
//!
//! ## Quick Start
//!
//! ```rust
//! use subsetsum_core::{run_search, Controller, Problem, SolverConfig};
//!
//! fn main() -> subsetsum_core::Result<()> {
//!     let problem = Problem::new(vec![1, 2, 3, -6, 10, -4, -6])?;
//!     let config = SolverConfig::default();
//!
//!     let mut controller =
//!         Controller::new_hash(&problem, config.threads, 0, 0, false)?;
//!     controller.generate_node_hash(config.threads)?;
//!
//!     let controller = controller;
//!     let mut solutions = Vec::new();
//!     std::thread::scope(|scope| {
//!         let sink = scope.spawn(|| {
//!             let mut taken = Vec::new();
//!             while let Some(mask) = controller.get_solution() {
//!                 taken.push(mask);
//!             }
//!             taken
//!         });
//!         run_search(&controller, &config, Vec::new())?;
//!         solutions = sink.join().expect("sink thread");
//!         Ok::<_, subsetsum_core::Error>(())
//!     })?;
//!
//!     for mask in solutions {
//!         assert!(problem.verify_mask(mask));
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod direct;
pub mod error;
pub mod gpu;
pub mod kernels;
#[cfg(test)]
mod kernels_tests;
pub mod node_hash;
#[cfg(test)]
mod node_hash_tests;
pub mod preprocess;
#[cfg(test)]
mod preprocess_tests;
pub mod problem;
#[cfg(test)]
mod problem_tests;
pub mod producer;
pub mod ring;
#[cfg(test)]
mod ring_tests;
pub mod solution;
pub mod worker;

pub use config::{Method, SolverConfig};
pub use controller::{run_search, Controller, Engine};
pub use error::{Error, Result};
pub use gpu::{select_devices, GpuDevice, GpuSearchWorker};
pub use kernels::{detect_kernel, NaiveKernel};
pub use problem::{parse_int128, solution_path, Problem};
pub use producer::NodeSubset;
pub use ring::SpanQueue;
pub use solution::SolutionQueue;
