//! mesh-index-bench - time index builds over mesh point data.
//!
//! Usage:
//!   mesh-index-bench run --config bench.json [--batch-size N] [--keep-artifacts]
//!   mesh-index-bench export --config bench.json --out points.mpts
//!
//! `run` loads the configured dataset once, then builds every configured
//! index in order, printing one report per trial:
//!
//!   <description>: <elapsed> secs
//!     index size: <MiB> MiB, <records> records, <entries> entries, rss +<MiB> MiB
//!
//! `export` streams the dataset into a flat point file that the
//! `point-file` dataset format can read back without the native reader.
//!
//! Logging goes to stderr and is controlled with RUST_LOG.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use meshidx::config::BenchConfig;
use meshidx::harness::BenchmarkHarness;
use meshidx::source::write_point_file;

#[derive(Parser, Debug)]
#[command(name = "mesh-index-bench", version, about = "Index build benchmarks over mesh points")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured trial and print timings.
    Run {
        /// JSON benchmark configuration.
        #[arg(long)]
        config: PathBuf,

        /// Override the cursor batch size (records per fetch).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Leave index artifacts on disk.
        #[arg(long)]
        keep_artifacts: bool,
    },
    /// Write the configured dataset to a point file.
    Export {
        /// JSON benchmark configuration (only `dataset` and `batch_size` are used).
        #[arg(long)]
        config: PathBuf,

        /// Destination point file.
        #[arg(long)]
        out: PathBuf,
    },
}

fn load_config(path: &Path) -> anyhow::Result<BenchConfig> {
    BenchConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn run(config: BenchConfig) -> anyhow::Result<ExitCode> {
    let mut harness = BenchmarkHarness::new();
    let mut cursor = harness
        .load_source(&config.dataset, config.batch_size)
        .with_context(|| format!("opening {}", config.dataset.describe()))?;

    if let Some(elapsed) = harness.load_elapsed() {
        println!("load source: {:.3} secs", elapsed.as_secs_f64());
    }

    let reports = harness.run_all(&mut cursor, &config);
    let mut failed = 0;
    for report in &reports {
        println!("{}", report);
        if !report.is_valid() {
            failed += 1;
        }
    }

    cursor.into_source().context("closing source")?;

    if failed > 0 {
        tracing::warn!("{} of {} trials failed", failed, reports.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn export(config: BenchConfig, out: PathBuf) -> anyhow::Result<ExitCode> {
    let mut harness = BenchmarkHarness::new();
    let mut cursor = harness
        .load_source(&config.dataset, config.batch_size)
        .with_context(|| format!("opening {}", config.dataset.describe()))?;

    let records = std::iter::from_fn(|| cursor.next().transpose());
    let written = write_point_file(&out, records)
        .with_context(|| format!("writing {}", out.display()))?;
    cursor.into_source().context("closing source")?;

    println!("wrote {} records to {}", written, out.display());
    Ok(ExitCode::SUCCESS)
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshidx=info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run {
            config,
            batch_size,
            keep_artifacts,
        } => {
            let mut config = load_config(&config)?;
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            config.keep_artifacts |= keep_artifacts;
            config.validate()?;
            run(config)
        }
        Command::Export { config, out } => export(load_config(&config)?, out),
    }
}
