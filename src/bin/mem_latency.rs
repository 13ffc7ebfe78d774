//! Cache and Memory Latency Measurement via Pointer Chasing
//!
//! Sweeps buffer sizes on a performance or efficiency core and prints the average latency of a
//! dependent load for each size, flagging the jumps that usually mark a cache level boundary.

use clap::Parser;
use log::warn;
use mem_latency_rs::params::DEFAULT_TARGET_ACCESSES;
use mem_latency_rs::{
    ChaseProbe, CoreClass, LatencySweep, RunStatus, SweepEntry, SweepEvent, TestParameters,
    estimate_level, format_size_fixed_int, is_level_jump,
};
use std::process::ExitCode;

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(about, long_about = None)]
struct Args {
    /// Sizes to test as SIZE_KB:PASSES, comma separated (default: built-in 1 KiB - 256 MiB ladder)
    #[arg(short, long, value_delimiter = ',')]
    sizes: Vec<SweepEntry>,

    /// Run on efficiency cores instead of performance cores
    #[arg(short, long)]
    efficiency: bool,

    /// Dependent loads per size for the built-in ladder
    #[arg(long, default_value_t = DEFAULT_TARGET_ACCESSES)]
    target_accesses: u64,

    /// Seed for the access permutation, for reproducible chains
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let entries = if args.sizes.is_empty() {
        TestParameters::default_sweep(args.target_accesses)
            .entries()
            .to_vec()
    } else {
        args.sizes
    };
    let core_class = if args.efficiency {
        CoreClass::Efficiency
    } else {
        CoreClass::Performance
    };
    let probe = match args.seed {
        Some(seed) => ChaseProbe::with_seed(seed),
        None => ChaseProbe::new(),
    };

    let sweep = LatencySweep::with_probe(probe);

    // Ctrl-C stops the sweep after the size being measured
    let stopper = sweep.clone();
    if let Err(e) = ctrlc::set_handler(move || stopper.request_stop()) {
        warn!("Couldn't install Ctrl-C handler, the sweep can't be stopped early: {e}");
    }

    let (handle, events) = match sweep.spawn_events(entries, core_class) {
        Ok(started) => started,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Cache & Memory Latency Measurement ({core_class})");
    println!("===================================");
    println!("Method: Pointer chasing with randomized single-cycle permutation");
    println!("Press Ctrl-C to stop after the current size\n");
    println!("{:>10} {:>12} {:>10}", "Size", "Latency (ns)", "Est. Level");
    println!("{:-<10} {:-<12} {:-<10}", "", "", "");

    let mut prev_latency = 0.0f64;
    let mut finished = None;
    for event in events {
        match event {
            SweepEvent::Measurement(m) => {
                // Show jump indicator for significant latency increases
                let jump = if is_level_jump(prev_latency, m.latency_ns) {
                    " ←"
                } else {
                    ""
                };
                println!(
                    "{:>10} {:>10.2} ns {:>10}{}",
                    format_size_fixed_int(m.size_kb * 1024),
                    m.latency_ns,
                    estimate_level(m.latency_ns),
                    jump
                );
                prev_latency = m.latency_ns;
            }
            SweepEvent::Finished(report) => finished = Some(report),
        }
    }

    if let Err(e) = handle.join() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    let Some(report) = finished else {
        eprintln!("error: sweep ended without a completion report");
        return ExitCode::FAILURE;
    };

    println!("\n← indicates significant latency jump (cache level transition)");
    if report.is_degraded() {
        warn!("Core binding was degraded, results may not reflect {core_class} latency");
    }

    match report.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Cancelled => {
            println!("Test cancelled after {} sizes", report.reported);
            ExitCode::SUCCESS
        }
        _ => {
            if let Some(e) = report.error {
                eprintln!("error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}
