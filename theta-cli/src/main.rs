//! Theta CLI: download, correction and store management commands.
//!
//! Commands:
//! - `download`: fetch option and underlying partitions for a date range
//! - `correct`: repair degenerate rows and short gaps under a directory
//! - `pipeline`: download then correct for an as-of date (or range)
//! - `holidays`: print the terminal's holiday calendar for a year
//! - `status`: inventory of the partition store

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use theta_core::calendar::parse_terminal_date;
use theta_core::corrector::{Corrector, ReportSet};
use theta_core::store::PartitionStore;
use theta_runner::{
    export_corrections_csv, save_run_report, Pipeline, RunConfig, RunSummary, StdoutProgress,
};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(
    name = "theta",
    about = "Theta CLI: option data acquisition and correction pipeline"
)]
struct Cli {
    /// TOML run configuration. Every field has a default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download option OHLC, greeks and underlying bars into the store.
    Download {
        /// Option roots to download (e.g., SPX VIX). Defaults to the config's list.
        symbols: Vec<String>,

        /// First trade date (YYYY-MM-DD or YYYYMMDD).
        #[arg(long)]
        start: String,

        /// Last trade date. Defaults to --start.
        #[arg(long)]
        end: Option<String>,

        /// Partition store root. Overrides the config.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Number of concurrent workers. Overrides the config.
        #[arg(long)]
        workers: Option<usize>,

        /// Re-download partitions that already pass the integrity check.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Write summary.json and failures.csv into this directory.
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Repair persisted partitions under a directory.
    Correct {
        /// Directory to scan (a store root or any subdirectory of it).
        #[arg(default_value = "data")]
        dir: PathBuf,

        /// Re-fetch degenerate rows from the terminal when within retention.
        #[arg(long, default_value_t = false)]
        refetch: bool,

        /// Write a per-partition CSV report to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Download and correct the configured symbols.
    Pipeline {
        /// As-of trade date. Defaults to today.
        #[arg(long)]
        as_of: Option<String>,

        /// Range end; with --as-of runs [as-of, end].
        #[arg(long)]
        end: Option<String>,

        /// Option roots. Overrides the config.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Write summary.json and failures.csv into this directory.
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Print the terminal's holiday calendar for a year.
    Holidays {
        year: i32,
    },
    /// Report partitions, rows and invalid files per symbol and kind.
    Status {
        /// Partition store root. Overrides the config.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Emit JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Download {
            symbols,
            start,
            end,
            output_dir,
            workers,
            force,
            report_dir,
        } => run_download(
            config, symbols, start, end, output_dir, workers, force, report_dir,
        ),
        Commands::Correct {
            dir,
            refetch,
            report,
        } => run_correct(config, dir, refetch, report),
        Commands::Pipeline {
            as_of,
            end,
            symbols,
            report_dir,
        } => run_pipeline(config, as_of, end, symbols, report_dir),
        Commands::Holidays { year } => run_holidays(config, year),
        Commands::Status { output_dir, json } => run_status(config, output_dir, json),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "theta=info,theta_core=info,theta_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(RunConfig::default()),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    parse_terminal_date(s).with_context(|| format!("invalid date {s:?}"))
}

/// Cancellation flag set on the first Ctrl-C.
fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::Relaxed) {
            eprintln!("Interrupted: finishing in-flight units, no new units will start");
        }
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn write_stats(pipeline: &Pipeline) {
    let Some(stats) = pipeline.stats() else {
        return;
    };
    stats.log_summary();
    if let Some(path) = &pipeline.config().terminal.stats_csv {
        if let Err(e) = stats.write_csv(path) {
            tracing::error!(path = %path.display(), error = %e, "failed to write request stats");
        }
    }
}

fn finish_run(summary: &RunSummary, report_dir: Option<&Path>) -> Result<()> {
    if let Some(dir) = report_dir {
        for path in save_run_report(summary, dir)? {
            println!("Wrote {}", path.display());
        }
    }
    if !summary.all_succeeded() {
        for f in &summary.failures {
            eprintln!("Error for {}: {}", f.unit, f.error);
        }
        if summary.cancelled > 0 {
            eprintln!("{} units not started (cancelled)", summary.cancelled);
        }
        std::process::exit(1);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_download(
    mut config: RunConfig,
    symbols: Vec<String>,
    start: String,
    end: Option<String>,
    output_dir: Option<PathBuf>,
    workers: Option<usize>,
    force: bool,
    report_dir: Option<PathBuf>,
) -> Result<()> {
    let start_date = parse_date(&start)?;
    let end_date = end.as_deref().map(parse_date).transpose()?.unwrap_or(start_date);
    if end_date < start_date {
        bail!("--end ({end_date}) is before --start ({start_date})");
    }

    if !symbols.is_empty() {
        config.symbols = symbols;
    }
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    if let Some(n) = workers {
        config.bulk.workers = n;
    }
    config.bulk.force |= force;
    config.validate()?;

    let cancel = install_interrupt_handler()?;
    let pipeline = Pipeline::connect(config)?
        .with_cancel_flag(cancel)
        .with_progress(Arc::new(StdoutProgress));
    let summary = pipeline.download(start_date, end_date)?;
    write_stats(&pipeline);
    finish_run(&summary, report_dir.as_deref())
}

fn print_corrections(reports: &ReportSet) {
    let totals = reports.totals();
    println!(
        "Corrected {} partitions: {} repaired, {} failed",
        reports.partitions(),
        reports.repaired(),
        reports.failed()
    );
    println!(
        "  rows: {} examined, {} repaired, {} inserted, {} unrepairable; {} gaps flagged",
        totals.rows_examined,
        totals.rows_repaired,
        totals.rows_inserted,
        totals.rows_unrepairable,
        totals.gaps_flagged
    );
}

fn run_correct(
    config: RunConfig,
    dir: PathBuf,
    refetch: bool,
    report: Option<PathBuf>,
) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let (corrector, pipeline) = if refetch {
        let pipeline = Pipeline::connect(config)?;
        (pipeline.corrector(), Some(pipeline))
    } else {
        (Corrector::new(config.corrector_config()), None)
    };

    let reports = corrector
        .batch_correct(&dir)
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    if let Some(pipeline) = &pipeline {
        write_stats(pipeline);
    }

    print_corrections(&reports);
    if let Some(path) = report {
        std::fs::write(&path, export_corrections_csv(&reports)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }

    if reports.failed() > 0 {
        for r in &reports.results {
            if let theta_core::corrector::PartitionOutcome::Failed { error, quarantined } =
                &r.outcome
            {
                let note = if *quarantined { " (quarantined)" } else { "" };
                eprintln!("Error for {}: {error}{note}", r.path.display());
            }
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_pipeline(
    mut config: RunConfig,
    as_of: Option<String>,
    end: Option<String>,
    symbols: Vec<String>,
    report_dir: Option<PathBuf>,
) -> Result<()> {
    let start = match as_of.as_deref() {
        Some(s) => parse_date(s)?,
        None => chrono::Local::now().date_naive(),
    };
    let end = end.as_deref().map(parse_date).transpose()?.unwrap_or(start);
    if end < start {
        bail!("--end ({end}) is before --as-of ({start})");
    }
    if !symbols.is_empty() {
        config.symbols = symbols;
    }
    config.validate()?;

    let cancel = install_interrupt_handler()?;
    let pipeline = Pipeline::connect(config)?
        .with_cancel_flag(cancel)
        .with_progress(Arc::new(StdoutProgress));
    let report = pipeline.run_range(start, end)?;

    print_corrections(&report.corrections);
    if report.corrections.failed() > 0 {
        eprintln!(
            "{} partitions failed correction",
            report.corrections.failed()
        );
    }
    finish_run(&report.summary, report_dir.as_deref())?;
    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_holidays(config: RunConfig, year: i32) -> Result<()> {
    let pipeline = Pipeline::connect(config)?;
    let entries = pipeline
        .source()
        .holidays(year)
        .with_context(|| format!("failed to fetch holidays for {year}"))?;
    if entries.is_empty() {
        println!("No holidays listed for {year}");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  {:<12}  {}",
            entry.date,
            format!("{:?}", entry.kind),
            entry.name.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn run_status(config: RunConfig, output_dir: Option<PathBuf>, json: bool) -> Result<()> {
    let root = output_dir.unwrap_or(config.output_dir);
    if !root.exists() {
        println!("Store is empty (no directory at {})", root.display());
        return Ok(());
    }

    let store = PartitionStore::new(&root);
    let status = store
        .status()
        .with_context(|| format!("failed to read store at {}", root.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Store: {}", root.display());
    println!(
        "{:<10} {:<16} {:>10} {:>12} {:>8} {:>12}",
        "SYMBOL", "KIND", "PARTITIONS", "ROWS", "INVALID", "QUARANTINED"
    );
    for s in &status {
        println!(
            "{:<10} {:<16} {:>10} {:>12} {:>8} {:>12}",
            s.symbol, s.kind, s.partitions, s.rows, s.invalid, s.quarantined
        );
    }
    let partitions: usize = status.iter().map(|s| s.partitions).sum();
    let rows: usize = status.iter().map(|s| s.rows).sum();
    println!("\nTotal: {partitions} partitions, {rows} rows");
    Ok(())
}
