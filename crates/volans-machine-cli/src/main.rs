#![forbid(unsafe_code)]

//! Native runner for the Volans translator.
//!
//! Feeds a raw x86-64 program image through the translate-execute loop and
//! prints the run summary. Useful for cache debugging: run the same image
//! twice and watch the second run replay from the translation cache.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use volans_machine::{Machine, MachineConfig};

#[derive(Debug, Parser)]
#[command(
    name = "volans",
    about = "Run an x86-64 program image through the Volans dynamic binary translator"
)]
struct Args {
    /// Raw x86-64 program image to load.
    #[arg(long)]
    program: PathBuf,

    /// Guest virtual address of the entry point (accepts 0x-hex).
    #[arg(long, default_value = "0x1000", value_parser = parse_guest_addr)]
    entry: u64,

    /// JSON configuration file; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the program N times (cache warm/replay testing).
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Delete every on-disk cache file before loading.
    #[arg(long)]
    clear_cache: bool,

    /// Write run statistics JSON to this path on exit.
    #[arg(long)]
    stats_out: Option<PathBuf>,

    /// Persist the signature database into the cache directory on exit.
    #[arg(long)]
    save_signatures: bool,
}

fn parse_guest_addr(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("invalid guest address: {text:?}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MachineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MachineConfig::default(),
    };

    let program = fs::read(&args.program)
        .with_context(|| format!("failed to read program {}", args.program.display()))?;

    let mut machine = Machine::new(config).context("failed to initialise the machine")?;
    if args.clear_cache {
        machine
            .clear_disk_cache()
            .context("failed to clear the cache directory")?;
    }

    let binary_id = machine
        .load_binary(&program, args.entry)
        .context("failed to load the guest binary")?;
    println!("loaded {} ({} bytes) as {binary_id}", args.program.display(), program.len());

    for pass in 1..=args.repeat.max(1) {
        let summary = machine.run().context("run failed")?;
        println!("pass {pass}: {} blocks dispatched", summary.iterations);
        for hot in &summary.hot_blocks {
            println!(
                "  hot block {:#x} executed {} times",
                hot.guest_addr, hot.executions
            );
        }
    }

    let stats = machine.stats();
    println!(
        "cache: {} L1 hits, {} L2 hits, {} misses ({} entries)",
        stats.cache.l1_hits, stats.cache.l2_hits, stats.cache.misses, stats.cache.entries
    );

    if let Some(path) = &args.stats_out {
        fs::write(path, stats.to_json_pretty())
            .with_context(|| format!("failed to write stats to {}", path.display()))?;
        println!("stats written to {}", path.display());
    }

    if args.save_signatures {
        machine
            .save_signatures()
            .context("failed to save the signature database")?;
    }

    Ok(())
}
