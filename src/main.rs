use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use caplayout::{run_all, CancellationToken, ScrapeOptions};

#[derive(Debug, Parser)]
#[command(
    name = "caplayout",
    about = "Scrape record layouts and sub-object capability bounds from DWARF binaries"
)]
struct Opts {
    /// Object files with DWARF debug info, one walker each.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Output SQLite database.
    #[arg(short, long, default_value = "layouts.db")]
    database: PathBuf,
    /// Number of parallel walkers (default: available cores).
    #[arg(short, long)]
    workers: Option<usize>,
    /// Store file paths relative to this directory.
    #[arg(long)]
    strip_prefix: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let opts = Opts::parse();

    let default_filter = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
            tracing::warn!(%err, "failed to install Ctrl-C handler");
        }
    }

    let mut options = ScrapeOptions {
        database: opts.database,
        strip_prefix: opts.strip_prefix,
        cancel,
        ..Default::default()
    };
    if let Some(workers) = opts.workers {
        options.workers = workers;
    }

    let summary = match run_all(&opts.inputs, &options) {
        Ok(summary) => summary,
        Err(err) => {
            eprintln!("caplayout: {err}");
            return ExitCode::FAILURE;
        }
    };

    for result in &summary.results {
        let s = &result.summary;
        if s.is_ok() {
            println!(
                "{}: {} units, {} types, {} members, {} duplicates",
                result.input.display(),
                s.cus_processed,
                s.types_inserted,
                s.members_inserted,
                s.dup_structs
            );
        } else {
            for reason in &s.errors {
                eprintln!("{}: failed: {reason}", result.input.display());
            }
        }
    }

    if summary.all_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
