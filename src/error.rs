//! Error types for the scraper library.
//!
//! Every failure a walker can hit is represented here so that the pool can
//! report per-input diagnostics without unwinding across threads.
//! Cancellation is deliberately not an error: a cancelled walker returns a
//! partial summary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while scraping one input binary.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// The input file could not be opened or read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The input is not a parseable object file or its DWARF is malformed.
    #[error("malformed debug info in {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    /// A compilation unit without a `DW_AT_name`. The walker cannot
    /// attribute records to a unit it cannot name.
    #[error("invalid compilation unit at offset {offset:#x}: missing DW_AT_name")]
    InvalidCompilationUnit { offset: u64 },

    /// `DW_AT_specification` chains are not handled; fail loudly rather
    /// than record a half-resolved type.
    #[error("DW_AT_specification unsupported on DIE at offset {offset:#x}")]
    UnsupportedSpecification { offset: u64 },

    /// Database constraint or I/O failure. Aborts the current transaction
    /// and the walker that hit it.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Low-level DWARF decoding failure from the reader.
    #[error("DWARF read error: {0}")]
    Dwarf(#[from] gimli::Error),

    /// Offsets and lengths are unsigned 64-bit; any computation that would
    /// wrap is fatal.
    #[error("arithmetic overflow computing bounds for offset={offset:#x} length={length:#x}")]
    BoundsOverflow { offset: u64, length: u64 },
}
