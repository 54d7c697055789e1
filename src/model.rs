//! In-memory rows and the per-unit working set.
//!
//! Row structs mirror the storage schema column-for-column; the walker
//! fills them with temporary local IDs which the drain step promotes to
//! stored IDs (see [`crate::walker`]).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Classification flags for records and member types, stored verbatim
    /// in the `flags` columns.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u32 {
        const STRUCT = 1 << 0;
        const UNION = 1 << 1;
        const CLASS = 1 << 2;
        const ANONYMOUS = 1 << 3;
        const POINTER = 1 << 4;
        const ARRAY = 1 << 5;
        const ENUM = 1 << 6;
        const BASE = 1 << 7;
        const FUNCTION = 1 << 8;
    }
}

impl TypeFlags {
    /// Flags that mark an aggregate the walker recurses into.
    pub const RECORD_MASK: TypeFlags = TypeFlags::from_bits_retain(
        TypeFlags::STRUCT.bits() | TypeFlags::UNION.bits() | TypeFlags::CLASS.bits(),
    );

    pub fn is_record(&self) -> bool {
        self.intersects(TypeFlags::RECORD_MASK)
    }
}

/// One `struct_type` row.
#[derive(Debug, Clone, Default)]
pub struct StructTypeRow {
    pub id: u64,
    pub file: String,
    pub line: u64,
    pub name: String,
    pub size: u64,
    pub flags: TypeFlags,
    pub has_imprecise: bool,
}

/// One `struct_member` row.
#[derive(Debug, Clone, Default)]
pub struct StructMemberRow {
    pub id: u64,
    pub owner: u64,
    pub nested: Option<u64>,
    pub name: String,
    pub type_name: String,
    pub line: u64,
    pub byte_size: u64,
    pub bit_size: Option<u64>,
    pub byte_offset: u64,
    pub bit_offset: Option<u64>,
    pub flags: TypeFlags,
    pub array_items: Option<u64>,
}

impl StructMemberRow {
    /// Length a sub-object capability for this member must cover. A
    /// bitfield tail rounds up to one extra byte.
    pub fn requested_length(&self) -> u64 {
        self.byte_size + u64::from(self.bit_size.is_some())
    }

    /// A variable-length array: element count absent or zero.
    pub fn is_vla(&self) -> bool {
        self.flags.contains(TypeFlags::ARRAY) && self.array_items.unwrap_or(0) == 0
    }
}

/// One flattened-layout row, feeding both `member_bounds` and
/// `layout_member`.
#[derive(Debug, Clone)]
pub struct FlatMemberRow {
    pub owner: u64,
    pub member: u64,
    /// `::`-joined name from the top-level record down.
    pub name: String,
    pub type_name: String,
    /// Cumulative byte offset from the start of the top-level record.
    pub offset: u64,
    pub byte_size: u64,
    /// Requested capability length (`byte_size` plus bitfield tail).
    pub length: u64,
    pub base: u64,
    pub top: u64,
    pub is_imprecise: bool,
    pub required_precision: u32,
    pub is_vla: bool,
}

/// Working-map key: two records are the same iff they share name, file
/// and line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub name: String,
    pub file: String,
    pub line: u64,
}

/// Per-unit working-set entry for one record.
#[derive(Debug, Clone, Default)]
pub struct RecordEntry {
    pub data: StructTypeRow,
    pub members: Vec<StructMemberRow>,
    pub flattened: Vec<FlatMemberRow>,
    /// Set when the record already existed in storage: its members and
    /// layout were recorded by whoever inserted it first.
    pub skip_postprocess: bool,
    pub has_vla: bool,
}

/// Process-wide ID allocation, shared by every walker of a run.
///
/// Counters start at 2: 0 means "unset", 1 is reserved. IDs are unique
/// across workers but not contiguous.
#[derive(Debug)]
pub struct IdAllocator {
    next_type: AtomicU64,
    next_member: AtomicU64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator {
            next_type: AtomicU64::new(2),
            next_member: AtomicU64::new(2),
        }
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_type_id(&self) -> u64 {
        self.next_type.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_member_id(&self) -> u64 {
        self.next_member.fetch_add(1, Ordering::Relaxed)
    }
}

/// Counted outcome of one walker run.
#[derive(Debug, Clone, Default)]
pub struct ScrapeSummary {
    pub cus_processed: u64,
    pub types_inserted: u64,
    pub members_inserted: u64,
    /// Records that already existed in storage (same name, file, line).
    pub dup_structs: u64,
    /// One-line diagnostics for fatal failures of this input.
    pub errors: Vec<String>,
}

impl ScrapeSummary {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Summary of one scheduled input, as resolved by the pool.
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub input: PathBuf,
    pub summary: ScrapeSummary,
}
