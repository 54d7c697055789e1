//! Whole-run orchestration: one walker per input over a shared database.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::dwarf::GimliSource;
use crate::error::ScrapeError;
use crate::model::{IdAllocator, ScrapeResult};
use crate::pool::{CancellationToken, ScrapePool};
use crate::storage::Storage;
use crate::walker::StructLayoutScraper;

/// Run-wide configuration for [`run_all`].
#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    /// Output database path; `:memory:` is accepted.
    pub database: PathBuf,
    /// Number of parallel walkers.
    pub workers: usize,
    /// When set, stored file paths are made relative to this directory.
    pub strip_prefix: Option<PathBuf>,
    /// Cancellation token shared with the pool, so callers can stop a run
    /// from the outside (e.g. a signal handler).
    pub cancel: CancellationToken,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        ScrapeOptions {
            database: PathBuf::from("layouts.db"),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            strip_prefix: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Aggregated outcome of a run, one entry per input.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub results: Vec<ScrapeResult>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &ScrapeResult> {
        self.results.iter().filter(|result| !result.summary.is_ok())
    }

    pub fn all_ok(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Scrapes every input into the configured database. Each input gets its
/// own walker; failures stay per-input and are reported in the summary.
pub fn run_all(paths: &[PathBuf], options: &ScrapeOptions) -> Result<RunSummary, ScrapeError> {
    let storage = Arc::new(Storage::open(&options.database)?);
    storage.init_schema()?;
    let ids = Arc::new(IdAllocator::new());
    let pool = ScrapePool::with_token(options.workers, options.cancel.clone());

    let handles: Vec<_> = paths
        .iter()
        .map(|path| {
            let path = path.clone();
            let storage = Arc::clone(&storage);
            let ids = Arc::clone(&ids);
            let strip_prefix = options.strip_prefix.clone();
            pool.schedule_with(path.clone(), move |token| {
                let source = GimliSource::open(&path)?;
                let mut scraper = StructLayoutScraper::new(source, storage, ids, strip_prefix);
                scraper.init_schema()?;
                scraper.run(token)?;
                Ok(scraper.into_summary())
            })
        })
        .collect();
    pool.wait();

    let results: Vec<ScrapeResult> = handles.into_iter().map(|handle| handle.wait()).collect();
    let failures = results.iter().filter(|r| !r.summary.is_ok()).count();
    info!(inputs = results.len(), failures, "scrape run complete");
    Ok(RunSummary { results })
}
