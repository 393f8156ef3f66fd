use std::time::Instant;

use freerange::{ArenaConfig, CbsConfig, Error, MvffPool, PoolConfig, Range};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Print a usage message
fn print_usage() {
    println!("freerange - failover free-range bookkeeping demo");
    println!("Usage:");
    println!("  freerange [OPTIONS] COMMAND");
    println!();
    println!("Options:");
    println!("  --extend-by N     Pool extension size in KB (default: 64)");
    println!("  --node-limit N    Most CBS nodes the free land may use (default: 8)");
    println!("  --ops N           Operations in the workload (default: 10000)");
    println!("  --seed N          Workload random seed (default: 1)");
    println!("  --spare F         Free fraction kept before returning memory (default: 0.75)");
    println!("  --verbose         Log fallbacks and repairs");
    println!("  --help            Show this help message");
    println!();
    println!("Commands:");
    println!("  workload          Run a random alloc/free workload and report sizes");
    println!("  describe          Run a short workload and print the pool's lands");
    println!("  version           Show version information");
}

/// Options parsed from the command line
struct Options {
    pool: PoolConfig,
    ops: usize,
    seed: u64,
    verbose: bool,
}

/// Take the value following flag `args[i]`, removing both
fn take_value(args: &mut Vec<String>, i: usize, flag: &str) -> Result<String, String> {
    if i + 1 < args.len() {
        args.remove(i);
        Ok(args.remove(i))
    } else {
        Err(format!("Missing value for {flag}"))
    }
}

/// Parse command line arguments
fn parse_args() -> Result<(Options, String), String> {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();

    if args.is_empty() || args.iter().any(|arg| arg == "--help") {
        print_usage();
        std::process::exit(0);
    }

    let mut options = Options {
        pool: PoolConfig::default().with_cbs(CbsConfig::default().with_extend_by(4).with_node_limit(8)),
        ops: 10_000,
        seed: 1,
        verbose: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--extend-by" => {
                let kb = take_value(&mut args, i, "--extend-by")?
                    .parse::<usize>()
                    .map_err(|_| "Invalid extend size".to_string())?;
                options.pool.extend_by = kb * 1024;
            }
            "--node-limit" => {
                let limit = take_value(&mut args, i, "--node-limit")?
                    .parse::<usize>()
                    .map_err(|_| "Invalid node limit".to_string())?;
                options.pool.cbs.node_limit = Some(limit);
            }
            "--ops" => {
                options.ops = take_value(&mut args, i, "--ops")?
                    .parse()
                    .map_err(|_| "Invalid operation count".to_string())?;
            }
            "--seed" => {
                options.seed = take_value(&mut args, i, "--seed")?
                    .parse()
                    .map_err(|_| "Invalid seed".to_string())?;
            }
            "--spare" => {
                options.pool.spare = take_value(&mut args, i, "--spare")?
                    .parse()
                    .map_err(|_| "Invalid spare fraction".to_string())?;
            }
            "--verbose" => {
                options.verbose = true;
                args.remove(i);
            }
            _ => {
                i += 1;
            }
        }
    }

    let command = args.first().cloned().ok_or_else(|| "Missing command".to_string())?;
    Ok((options, command))
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("freerange=debug")
        } else {
            EnvFilter::new("freerange=warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

/// Run `ops` random allocations and frees, returning what is still live
fn run_workload(pool: &mut MvffPool, ops: usize, seed: u64, report_every: usize) -> Result<Vec<Range>, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<Range> = Vec::new();

    for op in 1..=ops {
        if live.is_empty() || rng.gen_bool(0.55) {
            let size = rng.gen_range(8..=2048);
            live.push(pool.alloc(size)?);
        } else {
            let victim = rng.gen_range(0..live.len());
            pool.free(live.swap_remove(victim))?;
        }

        if report_every > 0 && op % report_every == 0 {
            let stats = pool.stats();
            println!(
                "{:>8} ops  total {:>10}  free {:>10}  cbs {:>8} in {:>4}  freelist {:>8} in {:>4}",
                op,
                stats.total,
                stats.free,
                stats.primary_free,
                stats.primary_blocks,
                stats.secondary_free,
                stats.secondary_blocks,
            );
        }
    }
    Ok(live)
}

/// Handle workload command
fn handle_workload(pool: &mut MvffPool, options: &Options) -> Result<(), Error> {
    println!("Running {} operations with seed {}...", options.ops, options.seed);
    let start = Instant::now();
    let live = run_workload(pool, options.ops, options.seed, (options.ops / 10).max(1))?;
    let duration = start.elapsed();

    let in_use: usize = live.iter().map(Range::size).sum();
    let stats = pool.stats();
    println!(
        "\n{} ops in {:?} ({:.2} ops/sec)",
        options.ops,
        duration,
        options.ops as f64 / duration.as_secs_f64()
    );
    println!("Live allocations: {} ({} bytes)", live.len(), in_use);
    println!("Pool span:        {} bytes over {} extensions", stats.total, stats.extensions);
    println!("Free:             {} bytes", stats.free);
    println!("  in cbs:         {} bytes, {} blocks", stats.primary_free, stats.primary_blocks);
    println!("  in freelist:    {} bytes, {} blocks", stats.secondary_free, stats.secondary_blocks);
    println!("Returned:         {} bytes", stats.returned);

    for range in live {
        pool.free(range)?;
    }
    pool.check()?;
    println!("All allocations freed, pool span now {} bytes", pool.size());
    Ok(())
}

/// Handle describe command
fn handle_describe(pool: &mut MvffPool, options: &Options) -> Result<(), Error> {
    let ops = options.ops.min(64);
    run_workload(pool, ops, options.seed, 0)?;
    print!("{}", pool.describe()?);
    Ok(())
}

/// Handle version command
fn handle_version() -> Result<(), Error> {
    println!("freerange v{}", env!("CARGO_PKG_VERSION"));
    println!("Failover free-range bookkeeping for pool allocators");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let (options, command) = match parse_args() {
        Ok(result) => result,
        Err(err) => {
            eprintln!("Error: {}", err);
            print_usage();
            std::process::exit(1);
        }
    };

    init_logging(options.verbose);

    let mut pool = MvffPool::with_arena_config(options.pool, ArenaConfig::default())?;

    // Dispatch command
    let result = match command.as_str() {
        "workload" => handle_workload(&mut pool, &options),
        "describe" => handle_describe(&mut pool, &options),
        "version" => handle_version(),
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            std::process::exit(1);
        }
    };

    // Handle errors
    if let Err(err) = result {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    Ok(())
}
