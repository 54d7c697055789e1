//! caplayout - record layouts and sub-object capability bounds from DWARF.
//!
//! This library walks the debug info of compiled binaries, collects every
//! struct/union/class and its members, flattens each record into its
//! transitive member layout, and computes for every member the smallest
//! compressed-capability bounds that enclose it. The result is a SQLite
//! database suitable for asking whether a program's sub-object pointers
//! are exactly representable under a given capability format, and which
//! members a widened capability would alias.
//!
//! # Modules
//!
//! - [`bounds`] - compressed-capability bounds arithmetic
//! - [`die`] - owned DIE trees and the [`die::DieSource`] contract
//! - [`dwarf`] - the gimli/object-backed DIE source
//! - [`model`] - rows, flags, working set and summaries
//! - [`storage`] - SQLite schema and shared access
//! - [`layout`] - flattened record layouts
//! - [`walker`] - the per-binary record walker
//! - [`pool`] - worker pool and cancellation
//! - [`scrape`] - whole-run orchestration
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use caplayout::{run_all, ScrapeOptions};
//!
//! let options = ScrapeOptions {
//!     database: PathBuf::from("layouts.db"),
//!     ..Default::default()
//! };
//! let summary = run_all(&[PathBuf::from("./a.out")], &options).unwrap();
//! assert!(summary.all_ok());
//! ```

pub mod bounds;
pub mod die;
pub mod dwarf;
pub mod error;
pub mod layout;
pub mod model;
pub mod pool;
pub mod scrape;
pub mod storage;
pub mod walker;

pub use bounds::CapabilityFormat;
pub use die::{Architecture, AttrValue, Die, DieSource, Unit, UnitBuilder};
pub use dwarf::GimliSource;
pub use error::ScrapeError;
pub use model::{IdAllocator, ScrapeResult, ScrapeSummary, TypeFlags};
pub use pool::{CancellationToken, ScrapeHandle, ScrapePool};
pub use scrape::{run_all, RunSummary, ScrapeOptions};
pub use storage::Storage;
pub use walker::StructLayoutScraper;
