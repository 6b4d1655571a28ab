//! `subsetsum`: command-line zero-sum subset solver.
//!
//! Loads one or more problem files (whitespace-separated decimal integers),
//! solves each, and writes the accepted solutions to `<problem>.sol`. A
//! progress line is repainted on stdout while the search runs; diagnostics
//! go to stderr via `tracing`.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser};
use subsetsum_core::{
    run_search, solution_path, Controller, Error, Method, NaiveKernel, Problem, SolverConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "subsetsum",
    version,
    about = "Finds every non-empty zero-sum subset of the input numbers",
    disable_help_flag = true
)]
struct Args {
    /// Number of CPU worker threads.
    #[arg(short = 'T', long = "threadsNum", value_name = "THREADS")]
    threads_num: Option<usize>,

    /// Use the naive method (default: hash).
    #[arg(short = 'N', long = "naive")]
    naive: bool,

    /// Node hash table bits.
    #[arg(short = 'S', long = "hashBits", value_name = "BITS", default_value_t = 0)]
    hash_bits: u32,

    /// Hashed suffix width.
    #[arg(short = 'h', long = "hashedNums", value_name = "NUMBERS", default_value_t = 0)]
    hashed_nums: u32,

    /// Store subset indices instead of sums (smaller tables, slower verify).
    #[arg(short = 'Y', long = "hashSubset")]
    hash_subset: bool,

    /// Use GPU devices in addition to the CPU workers.
    #[arg(short = 'G', long = "useGPU")]
    use_gpu: bool,

    /// Use only GPU devices.
    #[arg(short = 'H', long = "useOnlyGPU")]
    use_only_gpu: bool,

    /// Use only a CPU-type accelerator device.
    #[arg(short = 'P', long = "useOnlyCPUCL")]
    use_only_cpu_cl: bool,

    /// Use the grouped accelerator kernel variant.
    #[arg(short = 'X', long = "hashGroupping")]
    hash_groupping: bool,

    /// Request a native 64-bit device kernel for the naive method.
    #[arg(long = "use64BitCL")]
    use_64bit_cl: bool,

    /// Do not use CPU SIMD extensions.
    #[arg(long = "useStdCode")]
    use_std_code: bool,

    /// Force the SSE2 kernel.
    #[arg(long = "useSSE2")]
    use_sse2: bool,

    /// Force the SSE4.1 kernel.
    #[arg(long = "useSSE4.1")]
    use_sse41: bool,

    /// Print help.
    #[arg(long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Problem files.
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let ok = matches!(
                error.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = error.print();
            return if ok {
                std::process::ExitCode::SUCCESS
            } else {
                std::process::ExitCode::FAILURE
            };
        }
    };

    let threads = args
        .threads_num
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
    if threads == 0 {
        eprintln!("Threads number must be positive");
        return std::process::ExitCode::FAILURE;
    }
    if args.hash_bits >= 64 {
        eprintln!("NodeHashBits must be in range: 0-63");
        return std::process::ExitCode::FAILURE;
    }
    if args.hashed_nums >= 64 {
        eprintln!("NodeHashedNumbers must be in range: 0-63");
        return std::process::ExitCode::FAILURE;
    }

    let kernel = if args.use_std_code {
        Some(NaiveKernel::Scalar)
    } else if args.use_sse41 {
        Some(NaiveKernel::Sse41)
    } else if args.use_sse2 {
        Some(NaiveKernel::Sse2)
    } else {
        None
    };

    let config = SolverConfig {
        method: if args.naive { Method::Naive } else { Method::Hash },
        threads,
        hash_bits: args.hash_bits,
        hashed_numbers: args.hashed_nums,
        use_hash_subsets: args.hash_subset,
        kernel,
        use_cpu: !(args.use_only_gpu || args.use_only_cpu_cl),
        hash_grouping: args.hash_groupping,
        use_64bit_device: args.use_64bit_cl,
    };

    let mut exit = std::process::ExitCode::SUCCESS;
    for path in &args.files {
        if let Err(error) = solve_file(path, &config, &args) {
            eprintln!("Error encountered: {error}");
            exit = std::process::ExitCode::FAILURE;
        }
    }
    exit
}

/// Renders one solution block (`Solution: <i>` plus `index: value` lines).
fn format_solution(index: u64, mask: u128, numbers: &[i128]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Solution: {index}");
    for (x, value) in numbers.iter().enumerate() {
        if mask & (1u128 << x) != 0 {
            let _ = writeln!(out, "{x}: {value}");
        }
    }
    out
}

fn solve_file(path: &std::path::Path, config: &SolverConfig, args: &Args) -> Result<(), Error> {
    let problem = Problem::from_file(path)?;
    let sol_path = solution_path(path);
    // fresh solution file per run
    let _ = std::fs::remove_file(&sol_path);

    let total_timer = Instant::now();

    let gpu_devices =
        subsetsum_core::select_devices(args.use_gpu, args.use_only_gpu, args.use_only_cpu_cl);
    let cpu_workers = if config.use_cpu { config.threads } else { 0 };
    let total_workers = cpu_workers + gpu_devices.len();

    let controller = match config.method {
        Method::Naive => {
            tracing::info!("using naive method");
            Controller::new_naive(&problem, total_workers)
        }
        Method::Hash => {
            tracing::info!("using hash method");
            let mut controller = Controller::new_hash(
                &problem,
                total_workers,
                config.hash_bits,
                config.hashed_numbers,
                config.use_hash_subsets,
            )?;
            let hash_timer = Instant::now();
            controller.generate_node_hash(config.threads)?;
            tracing::info!(elapsed = ?hash_timer.elapsed(), "node hash generated");
            controller
        }
    };
    let search_timer = Instant::now();
    let progress_stop = AtomicBool::new(false);
    let mut search_result = Ok(());
    let mut saved_solutions: u64 = 0;

    std::thread::scope(|scope| {
        let controller: &Controller = &controller;

        // single sink: re-verify each solution against the original input
        // and append it to the .sol file; on a write failure keep draining
        // so the workers never stall on a full solution queue
        let saver = scope.spawn(|| -> Result<u64, Error> {
            let mut saved: u64 = 0;
            let mut write_error: Option<Error> = None;
            while let Some(mask) = controller.get_solution() {
                if write_error.is_some() {
                    continue;
                }
                if !problem.verify_mask(mask) {
                    eprintln!("Solver sent incorrect solution! ({saved})");
                    continue;
                }
                let write = File::options()
                    .append(true)
                    .create(true)
                    .open(&sol_path)
                    .and_then(|mut file| {
                        file.write_all(format_solution(saved, mask, problem.numbers()).as_bytes())
                    });
                match write {
                    Ok(()) => saved += 1,
                    Err(error) => write_error = Some(error.into()),
                }
            }
            match write_error {
                Some(error) => Err(error),
                None => Ok(saved),
            }
        });

        let progress = scope.spawn(|| {
            while !progress_stop.load(Ordering::Acquire) {
                print!("{}\r", controller.progress_string());
                let _ = std::io::stdout().flush();
                std::thread::sleep(Duration::from_millis(100));
            }
        });

        search_result = run_search(controller, config, gpu_devices);

        progress_stop.store(true, Ordering::Release);
        let _ = progress.join();
        match saver.join() {
            Ok(Ok(saved)) => saved_solutions = saved,
            Ok(Err(error)) => {
                if search_result.is_ok() {
                    search_result = Err(error);
                }
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    });
    search_result?;

    let search_elapsed = search_timer.elapsed();
    let total_elapsed = total_timer.elapsed();
    println!("\nTime: {:.3}s\nTotal Time: {:.3}s", search_elapsed.as_secs_f64(), total_elapsed.as_secs_f64());

    let mnodes = controller.mnodes_count();
    let sub_megas = controller.sub_mega_count();
    if mnodes != 0 {
        println!("\nFound {} solutions after {mnodes}{sub_megas:06} Nodes!", controller.solutions_num());
    } else {
        println!("\nFound {} solutions after {sub_megas} Nodes!", controller.solutions_num());
    }
    if saved_solutions != 0 {
        println!("Solutions available in {}", sol_path.display());
    }
    Ok(())
}
