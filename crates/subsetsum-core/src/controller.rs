//! Job controller and orchestration: owns the shared state of one search,
//! builds the method-specific tables, runs the producer and the worker pool,
//! and tears everything down in the required order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::{Method, SolverConfig};
use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, GpuSearchWorker};
use crate::kernels::detect_kernel;
use crate::node_hash::{build_node_hash, NodeHash, SubsumTables};
use crate::preprocess::{HashLayout, NaiveTables};
use crate::problem::Problem;
use crate::producer::{generate_hash, generate_naive, solve_small, NodeSubset};
use crate::ring::SpanQueue;
use crate::solution::SolutionQueue;
use crate::worker::{hash_cpu_queue_size, hash_cpu_worker, naive_cpu_queue_size, naive_cpu_worker};

/// Node region width of the naive method.
const NAIVE_NODE_BITS: u32 = 14;
/// Solution queue depth between workers and the sink.
const SOLUTION_QUEUE_LEN: usize = 20;

/// Method-specific preprocessor outputs. Empty variants mean the problem is
/// small enough to solve exhaustively in the producer.
pub enum Engine {
    /// Naive method tables (node region = last 14 input slots).
    Naive(Option<NaiveTables>),
    /// Hash method: layout, node hash and worker-side subsum tables.
    Hash(HashEngine),
}

/// State of the hash method.
pub struct HashEngine {
    /// Reordered regions and gate table; `None` for small problems.
    pub layout: Option<HashLayout>,
    /// Store subset indices instead of sums.
    pub use_subsets: bool,
    /// Built by [`Controller::generate_node_hash`].
    pub node_hash: Option<NodeHash>,
    /// 8-bit-chunk tables for subset-mode probing (workers and GPU).
    pub worker_subsums: Option<SubsumTables>,
}

struct Progress {
    mnodes: u64,
    sub_megas: u64,
    message: String,
}

/// Shared state of one search job.
pub struct Controller {
    numbers: Vec<i128>,
    total_workers: usize,
    node_bits: u32,
    engine: Engine,
    solutions: SolutionQueue<u128>,
    progress: Mutex<Progress>,
    /// Outside the progress mutex: the sink polls this while a worker may be
    /// blocked pushing into a full solution queue.
    pushed_solutions: AtomicU64,
    taken_solutions: AtomicU64,
    finished: AtomicBool,
    ring: OnceLock<SpanQueue<NodeSubset>>,
}

impl Controller {
    fn new(problem: &Problem, total_workers: usize, engine: Engine, node_bits: u32) -> Self {
        Self {
            numbers: problem.numbers().to_vec(),
            total_workers,
            node_bits,
            engine,
            solutions: SolutionQueue::new(SOLUTION_QUEUE_LEN),
            progress: Mutex::new(Progress {
                mnodes: 0,
                sub_megas: 0,
                message: String::new(),
            }),
            pushed_solutions: AtomicU64::new(0),
            taken_solutions: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            ring: OnceLock::new(),
        }
    }

    /// Builds a naive-method controller.
    #[must_use]
    pub fn new_naive(problem: &Problem, total_workers: usize) -> Self {
        let n = problem.len();
        let (tables, node_bits) = if n > 16 {
            (Some(NaiveTables::build(problem.numbers())), NAIVE_NODE_BITS)
        } else {
            (None, 0)
        };
        Self::new(problem, total_workers, Engine::Naive(tables), node_bits)
    }

    /// Builds a hash-method controller (node hash not yet generated).
    ///
    /// # Errors
    ///
    /// Propagates layout construction failures.
    pub fn new_hash(
        problem: &Problem,
        total_workers: usize,
        hash_bits: u32,
        hashed_numbers: u32,
        use_subsets: bool,
    ) -> Result<Self> {
        let n = problem.len();
        if n <= 16 {
            return Ok(Self::new(
                problem,
                total_workers,
                Engine::Hash(HashEngine {
                    layout: None,
                    use_subsets,
                    node_hash: None,
                    worker_subsums: None,
                }),
                0,
            ));
        }
        let layout = HashLayout::build(problem.numbers(), hash_bits, hashed_numbers)?;
        let worker_subsums =
            use_subsets.then(|| SubsumTables::new(&layout.node_problem[8..], 8));
        let node_bits = layout.node_bits;
        Ok(Self::new(
            problem,
            total_workers,
            Engine::Hash(HashEngine {
                layout: Some(layout),
                use_subsets,
                node_hash: None,
                worker_subsums,
            }),
            node_bits,
        ))
    }

    /// Builds the node hash with `threads` short-lived workers. A no-op for
    /// the naive method, small problems, and repeated calls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HashBucketOverflow`] when a bucket exceeds 65535
    /// entries.
    pub fn generate_node_hash(&mut self, threads: usize) -> Result<()> {
        if let Engine::Hash(hash_engine) = &mut self.engine {
            if hash_engine.node_hash.is_some() {
                return Ok(());
            }
            if let Some(layout) = &hash_engine.layout {
                let hashed = &layout.node_problem[8..];
                hash_engine.node_hash = Some(build_node_hash(
                    hashed,
                    layout.node_hash_bits,
                    hash_engine.use_subsets,
                    threads,
                )?);
            }
        }
        Ok(())
    }

    /// Input numbers in original order.
    #[must_use]
    pub fn numbers(&self) -> &[i128] {
        &self.numbers
    }

    /// Node region width (0 when the problem is solved exhaustively).
    #[must_use]
    pub fn node_bits(&self) -> u32 {
        self.node_bits
    }

    /// Method-specific state.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The naive `sumChanges` table.
    ///
    /// # Panics
    ///
    /// Panics when called on a hash-method or small-problem controller.
    #[must_use]
    pub fn naive_sum_changes(&self) -> &[i64; 41] {
        match &self.engine {
            Engine::Naive(Some(tables)) => &tables.sum_changes,
            _ => panic!("naive tables are only built for naive problems of >16 numbers"),
        }
    }

    /// The work ring.
    ///
    /// # Panics
    ///
    /// Panics before `init_ring` ran.
    #[must_use]
    pub fn mem_queue(&self) -> &SpanQueue<NodeSubset> {
        self.ring
            .get()
            .expect("ring initialised before producer/workers start")
    }

    /// Sizes and creates the ring from the aggregate of the workers'
    /// recommended capacities.
    pub fn init_ring(&self, elems: usize) {
        let concur = match self.engine {
            Engine::Naive(_) => self.total_workers * 3,
            Engine::Hash(_) => self.total_workers * 10,
        } as u32;
        let queue = SpanQueue::new(elems * 3, concur, concur);
        tracing::info!(
            elems = queue.queue_size(),
            concur_ops = concur,
            "mem queue initialized"
        );
        let _ = self.ring.set(queue);
    }

    /// Queues one solution (bitmask in original input numbering).
    pub fn put_solution(&self, solution: u128) {
        self.pushed_solutions.fetch_add(1, Ordering::AcqRel);
        self.solutions.push(solution, None);
    }

    /// Takes the next solution; `None` once the job finished and every
    /// queued solution was taken.
    pub fn get_solution(&self) -> Option<u128> {
        let pushed = self.pushed_solutions.load(Ordering::Acquire);
        if self.finished.load(Ordering::Acquire)
            && self.taken_solutions.load(Ordering::Acquire) == pushed
        {
            return None;
        }
        let solution = self.solutions.pop(None)?;
        self.taken_solutions.fetch_add(1, Ordering::AcqRel);
        Some(solution)
    }

    /// Number of solutions emitted so far.
    #[must_use]
    pub fn solutions_num(&self) -> u64 {
        self.pushed_solutions.load(Ordering::Acquire)
    }

    /// Mega-nodes processed.
    #[must_use]
    pub fn mnodes_count(&self) -> u64 {
        self.progress.lock().mnodes
    }

    /// Sub-mega node remainder.
    #[must_use]
    pub fn sub_mega_count(&self) -> u64 {
        self.progress.lock().sub_megas
    }

    /// Adds processed-node counts and refreshes the progress bitstring.
    pub fn update_progress(&self, nodes_count: u64, last_subset: u128) {
        let mut progress = self.progress.lock();
        let mega_diff = nodes_count / 1_000_000;
        progress.mnodes += mega_diff;
        progress.sub_megas += nodes_count - mega_diff * 1_000_000;
        if progress.sub_megas >= 1_000_000 {
            progress.mnodes += 1;
            progress.sub_megas -= 1_000_000;
        }
        progress.message.clear();
        if self.node_bits != 0 {
            let ctrl_bits = self.numbers.len() - self.node_bits as usize;
            for i in 0..ctrl_bits {
                progress
                    .message
                    .push(if last_subset & (1u128 << i) != 0 { '1' } else { '0' });
            }
        }
    }

    /// One-line progress summary (`Sols: <n>. <nodes> Nodes. <bitstring>`).
    #[must_use]
    pub fn progress_string(&self) -> String {
        let pushed = self.pushed_solutions.load(Ordering::Acquire);
        let progress = self.progress.lock();
        if progress.mnodes != 0 {
            format!(
                "Sols: {}. {}{:06} Nodes. {}",
                pushed, progress.mnodes, progress.sub_megas, progress.message
            )
        } else {
            format!(
                "Sols: {}. {} Nodes. {}",
                pushed, progress.sub_megas, progress.message
            )
        }
    }

    /// Marks the job finished; cancels the solution queue once drained.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        if self.solutions.is_empty() {
            self.solutions.cancel();
        }
    }

    /// Runs the producer on the current thread and closes the ring.
    pub fn generate_work(&self) {
        if self.numbers.len() <= 16 {
            solve_small(&self.numbers, |solution| self.put_solution(solution));
            self.mem_queue().close();
            return;
        }
        match &self.engine {
            Engine::Naive(_) => generate_naive(&self.numbers, self.mem_queue()),
            Engine::Hash(hash_engine) => {
                let layout = hash_engine
                    .layout
                    .as_ref()
                    .expect("layout exists for problems of >16 numbers");
                generate_hash(layout, self.mem_queue());
            }
        }
        self.mem_queue().close();
    }
}

/// Spawns the worker pool, runs the producer, and joins everything in the
/// required order: producer finishes and closes the ring, workers drain and
/// exit, then the controller is marked finished.
///
/// # Errors
///
/// Returns the first worker error; the ring is cancelled so every other
/// thread unblocks before this returns. The controller is marked finished on
/// every path, so a concurrent solution sink always terminates.
pub fn run_search(
    ctl: &Controller,
    config: &SolverConfig,
    gpu_devices: Vec<GpuDevice>,
) -> Result<()> {
    let result = run_search_inner(ctl, config, gpu_devices);
    ctl.finish();
    result
}

fn run_search_inner(
    ctl: &Controller,
    config: &SolverConfig,
    gpu_devices: Vec<GpuDevice>,
) -> Result<()> {
    let n = ctl.numbers().len();
    if n <= 16 {
        // too small to split into packets; the producer solves it alone
        ctl.init_ring(1);
        ctl.generate_work();
        return Ok(());
    }

    let cpu_workers = if config.use_cpu { config.threads } else { 0 };

    let mut gpu_workers = Vec::with_capacity(gpu_devices.len());
    for device in gpu_devices {
        gpu_workers.push(GpuSearchWorker::new(device, ctl, config)?);
    }
    if cpu_workers + gpu_workers.len() == 0 {
        return Err(Error::NoWorkers);
    }

    if let (Method::Hash, Engine::Hash(hash_engine)) = (config.method, ctl.engine()) {
        if hash_engine.node_hash.is_none() {
            return Err(Error::NodeHashMissing);
        }
    }

    let per_cpu = match config.method {
        Method::Naive => naive_cpu_queue_size(),
        Method::Hash => hash_cpu_queue_size(),
    };
    let mut ring_elems = cpu_workers * per_cpu;
    for worker in &gpu_workers {
        ring_elems += worker.queue_share();
    }
    ctl.init_ring(ring_elems);

    let kernel = config.kernel.unwrap_or_else(detect_kernel);
    if config.method == Method::Naive && cpu_workers > 0 {
        tracing::info!(?kernel, workers = cpu_workers, "naive cpu workers");
    }

    let first_error: Mutex<Option<Error>> = Mutex::new(None);
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..cpu_workers {
            handles.push(scope.spawn(|| match (config.method, ctl.engine()) {
                (Method::Naive, _) => naive_cpu_worker(ctl, kernel),
                (Method::Hash, Engine::Hash(hash_engine)) => {
                    let layout = hash_engine
                        .layout
                        .as_ref()
                        .expect("layout exists for problems of >16 numbers");
                    let hash = hash_engine
                        .node_hash
                        .as_ref()
                        .expect("checked before spawning");
                    hash_cpu_worker(ctl, layout, hash, hash_engine.worker_subsums.as_ref());
                }
                (Method::Hash, Engine::Naive(_)) => {
                    unreachable!("hash config requires a hash controller")
                }
            }));
        }
        for worker in &mut gpu_workers {
            let first_error = &first_error;
            handles.push(scope.spawn(move || {
                if let Err(error) = worker.run(ctl) {
                    tracing::error!(%error, "gpu worker failed");
                    ctl.mem_queue().cancel();
                    first_error.lock().get_or_insert(error);
                }
            }));
        }

        ctl.generate_work();
        for handle in handles {
            if let Err(panic) = handle.join() {
                ctl.mem_queue().cancel();
                std::panic::resume_unwind(panic);
            }
        }
    });

    match first_error.into_inner() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
