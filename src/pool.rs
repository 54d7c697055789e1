//! Worker pool and cooperative cancellation.
//!
//! One walker runs per scheduled input, on a bounded set of OS threads.
//! [`ScrapePool::cancel`] flips the shared token and makes workers drop
//! queued jobs; running walkers observe the token at compilation-unit
//! boundaries and return partial summaries. Handles resolve either with
//! the walker's summary or, for jobs dropped before they started, with an
//! empty one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::error;

use crate::die::DieSource;
use crate::error::ScrapeError;
use crate::model::{ScrapeResult, ScrapeSummary};
use crate::walker::StructLayoutScraper;

/// Shared cancellation flag, polled by walkers between compilation units.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

type Job = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;

/// Fixed-size thread pool running one walker per scheduled input.
pub struct ScrapePool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl ScrapePool {
    pub fn new(worker_count: usize) -> Self {
        Self::with_token(worker_count, CancellationToken::new())
    }

    /// Builds a pool driven by an externally owned token, so callers can
    /// wire cancellation to e.g. a signal handler.
    pub fn with_token(worker_count: usize, token: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..worker_count.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let token = token.clone();
                thread::Builder::new()
                    .name(format!("scrape-{index}"))
                    .spawn(move || loop {
                        let job = receiver.lock().unwrap().recv();
                        let Ok(job) = job else { break };
                        // Queued-but-unstarted work is dropped on
                        // cancellation; its handle resolves empty.
                        if token.is_cancelled() {
                            continue;
                        }
                        job(&token);
                    })
                    .expect("failed to spawn scrape worker")
            })
            .collect();
        ScrapePool {
            sender: Some(sender),
            workers,
            token,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Schedules a walker: schema init, run, summary. The returned handle
    /// resolves once the walker finishes or fails.
    pub fn schedule<S>(&self, mut scraper: StructLayoutScraper<S>) -> ScrapeHandle
    where
        S: DieSource + Send + 'static,
    {
        let input = scraper.source().path().to_path_buf();
        self.schedule_with(input, move |token| {
            scraper.init_schema()?;
            scraper.run(token)?;
            Ok(scraper.into_summary())
        })
    }

    /// Schedules an arbitrary scrape job. Errors become one-line
    /// diagnostics on the summary instead of propagating across threads.
    pub fn schedule_with(
        &self,
        input: PathBuf,
        job: impl FnOnce(&CancellationToken) -> Result<ScrapeSummary, ScrapeError> + Send + 'static,
    ) -> ScrapeHandle {
        let (result_tx, result_rx) = mpsc::channel();
        let job_input = input.clone();
        let boxed: Job = Box::new(move |token| {
            let summary = match job(token) {
                Ok(summary) => summary,
                Err(err) => {
                    error!(input = %job_input.display(), %err, "scrape failed");
                    ScrapeSummary {
                        errors: vec![err.to_string()],
                        ..Default::default()
                    }
                }
            };
            let _ = result_tx.send(summary);
        });
        if let Some(sender) = &self.sender {
            let _ = sender.send(boxed);
        }
        ScrapeHandle {
            input,
            receiver: result_rx,
        }
    }

    /// Drops all not-yet-started work and asks running walkers to stop at
    /// their next unit boundary.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Blocks until every pending job has completed and the workers have
    /// exited.
    pub fn wait(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ScrapePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pending result of one scheduled input.
pub struct ScrapeHandle {
    input: PathBuf,
    receiver: Receiver<ScrapeSummary>,
}

impl ScrapeHandle {
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Blocks until the job resolves. A job dropped by cancellation
    /// before it started resolves with an empty summary.
    pub fn wait(self) -> ScrapeResult {
        let summary = self.receiver.recv().unwrap_or_default();
        ScrapeResult {
            input: self.input,
            summary,
        }
    }
}
