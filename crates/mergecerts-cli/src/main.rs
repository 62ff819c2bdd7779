//! # mergecerts
//!
//! Merge certificate directories into one prefix-sharded tree of hard links.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use mergecerts_shard::logging::{init_logging, LogLevel};
use mergecerts_shard::{
    log_cli_debug, log_cli_info, merge, DryRunOps, MergeOptions, MergePlan, ShardTree,
};

/// Merge certificate directories into DESTDIR, sharded by name prefix.
///
/// Each regular file `abcd...` in a SRCDIR is hard-linked to
/// DESTDIR/ab/cd/abcd.... When that path already exists, the source file is
/// replaced by a link to it instead.
#[derive(Parser, Debug)]
#[command(name = "mergecerts")]
#[command(version, about, long_about)]
struct Cli {
    /// Destination root (created if missing)
    #[arg(value_name = "DESTDIR")]
    dest: PathBuf,

    /// Source directories, processed left to right
    #[arg(value_name = "SRCDIR", required = true, num_args = 1..)]
    sources: Vec<PathBuf>,

    /// Print what would be done without touching the filesystem
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Print destination tree statistics after merging
    #[arg(long)]
    stats: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version land here too, on stdout.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(LogLevel::from_verbosity(cli.verbose));

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mergecerts: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    log_cli_debug!(
        "Starting merge",
        dest = tracing::field::display(cli.dest.display()),
        sources = cli.sources.len(),
        dry_run = cli.dry_run,
    );

    if cli.dry_run {
        return print_plan(cli);
    }

    let options = MergeOptions { dry_run: false };
    let report = merge(&cli.dest, &cli.sources, &options)
        .with_context(|| format!("merge into {} aborted", cli.dest.display()))?;

    log_cli_info!(
        "Done",
        linked = report.linked,
        deduplicated = report.deduplicated,
        already_linked = report.already_linked,
    );

    if cli.stats {
        let stats = ShardTree::new(&cli.dest)
            .stats()
            .context("Failed to collect destination statistics")?;
        println!(
            "shards: {}  files: {}  shared: {}",
            stats.shard_dirs, stats.files, stats.shared_files
        );
    }

    Ok(())
}

fn print_plan(cli: &Cli) -> Result<()> {
    let plan = MergePlan::build(&cli.dest, &cli.sources)
        .with_context(|| format!("planning merge into {} failed", cli.dest.display()))?;

    for planned in plan.files() {
        println!(
            "{:<14} {} -> {}",
            planned.action.to_string(),
            planned.file.path.display(),
            planned.dest.display()
        );
    }

    let ops = DryRunOps::new();
    let report = plan
        .apply(&ops)
        .with_context(|| format!("dry run into {} failed", cli.dest.display()))?;
    for op in ops.operations() {
        println!("  {op}");
    }

    println!(
        "dry run: {} to link, {} to dedup, {} already linked, {} skipped",
        report.linked, report.deduplicated, report.already_linked, report.skipped
    );

    if cli.stats {
        let stats = plan
            .tree()
            .stats()
            .context("Failed to collect destination statistics")?;
        println!(
            "shards: {}  files: {}  shared: {}",
            stats.shard_dirs, stats.files, stats.shared_files
        );
    }

    Ok(())
}
