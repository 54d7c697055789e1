//! DWARF record walker.
//!
//! One walker owns one input binary. It iterates the compilation units of
//! its [`DieSource`], collects every struct/class/union definition and its
//! members into a per-unit working set, and drains that set into storage
//! at each unit boundary:
//!
//! 1. Transaction #1 inserts record and member rows. Records that already
//!    exist in the database keep their stored ID; the local ID is remapped
//!    and the entry is marked so the postprocess does not duplicate its
//!    layout.
//! 2. The flattener expands each remaining record (see [`crate::layout`]).
//! 3. Transaction #2 inserts the flattened bounds and layout rows and
//!    materialises the sub-object alias pairs.
//!
//! The walker polls the cancellation token once per unit and stops
//! between units, leaving already-committed units in place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::die::{Architecture, Die, DieSource, Unit};
use crate::error::ScrapeError;
use crate::layout;
use crate::model::{
    IdAllocator, RecordEntry, RecordKey, ScrapeSummary, StructMemberRow, StructTypeRow, TypeFlags,
};
use crate::pool::CancellationToken;
use crate::storage::{self, Storage};

/// Pointer size assumed when a pointer DIE carries no explicit byte size.
const DEFAULT_POINTER_SIZE: u64 = 8;

/// Result of classifying a member's type.
struct TypeDesc<'a> {
    type_name: String,
    byte_size: u64,
    flags: TypeFlags,
    array_items: Option<u64>,
    /// The aggregate definition DIE, when the type is (or contains) one.
    record: Option<Die<'a>>,
}

/// Walks the records of one input binary into shared storage.
pub struct StructLayoutScraper<S: DieSource> {
    source: S,
    storage: Arc<Storage>,
    ids: Arc<IdAllocator>,
    strip_prefix: Option<PathBuf>,
    arch: Architecture,
    entries: Vec<RecordEntry>,
    key_index: HashMap<RecordKey, usize>,
    summary: ScrapeSummary,
}

impl<S: DieSource> StructLayoutScraper<S> {
    pub fn new(
        source: S,
        storage: Arc<Storage>,
        ids: Arc<IdAllocator>,
        strip_prefix: Option<PathBuf>,
    ) -> Self {
        let arch = source.architecture();
        StructLayoutScraper {
            source,
            storage,
            ids,
            strip_prefix,
            arch,
            entries: Vec::new(),
            key_index: HashMap::new(),
            summary: ScrapeSummary::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn summary(&self) -> &ScrapeSummary {
        &self.summary
    }

    pub fn into_summary(self) -> ScrapeSummary {
        self.summary
    }

    /// Creates the schema. Idempotent; called once before [`Self::run`].
    pub fn init_schema(&self) -> Result<(), ScrapeError> {
        self.storage.init_schema()
    }

    /// Processes every compilation unit of the input. Checks the token at
    /// each unit boundary and returns early (with a partial summary) when
    /// cancellation was requested.
    pub fn run(&mut self, token: &CancellationToken) -> Result<(), ScrapeError> {
        loop {
            if token.is_cancelled() {
                debug!(input = %self.source.path().display(), "cancelled, stopping between units");
                return Ok(());
            }
            let Some(unit) = self.source.next_unit()? else {
                break;
            };
            self.begin_unit(&unit)?;
            self.walk_unit(&unit)?;
            self.end_unit()?;
            self.summary.cus_processed += 1;
        }
        Ok(())
    }

    fn begin_unit(&self, unit: &Unit) -> Result<(), ScrapeError> {
        if unit.is_empty() {
            return Err(ScrapeError::InvalidCompilationUnit { offset: 0 });
        }
        let root = unit.root();
        let Some(name) = root.text(gimli::DW_AT_name) else {
            return Err(ScrapeError::InvalidCompilationUnit {
                offset: root.offset(),
            });
        };
        debug!(unit = name, "enter compilation unit");
        Ok(())
    }

    fn walk_unit(&mut self, unit: &Unit) -> Result<(), ScrapeError> {
        for die in unit.dies() {
            let kind = match die.tag() {
                gimli::DW_TAG_structure_type => TypeFlags::STRUCT,
                gimli::DW_TAG_class_type => TypeFlags::CLASS,
                gimli::DW_TAG_union_type => TypeFlags::UNION,
                _ => continue,
            };
            self.visit_record(die, kind)?;
        }
        Ok(())
    }

    /// Records one struct/class/union definition and its members in the
    /// working set. Returns the record's local ID, or `None` when the DIE
    /// is only a declaration or lacks the attributes a layout needs.
    fn visit_record(&mut self, die: Die<'_>, kind: TypeFlags) -> Result<Option<u64>, ScrapeError> {
        if die.has(gimli::DW_AT_declaration) {
            return Ok(None);
        }
        if die.has(gimli::DW_AT_specification) {
            return Err(ScrapeError::UnsupportedSpecification {
                offset: die.offset(),
            });
        }

        let Some(size) = die.unsigned(gimli::DW_AT_byte_size) else {
            warn!(offset = die.offset(), "record without byte size, skipping");
            return Ok(None);
        };

        let file = self.strip(die.decl_file().unwrap_or(""));
        let line = die.decl_line();
        let (name, anonymous) = self.record_name(die);
        let mut flags = kind;
        if anonymous {
            flags |= TypeFlags::ANONYMOUS;
        }

        let key = RecordKey {
            name: name.clone(),
            file: file.clone(),
            line,
        };
        if let Some(&index) = self.key_index.get(&key) {
            return Ok(Some(self.entries[index].data.id));
        }

        let row = StructTypeRow {
            id: self.ids.next_type_id(),
            file,
            line,
            name,
            size,
            flags,
            has_imprecise: false,
        };
        let id = row.id;

        let mut members = Vec::new();
        let mut member_index = 0;
        for child in die.children() {
            if child.tag() == gimli::DW_TAG_member {
                members.push(self.visit_member(child, &row, member_index)?);
                member_index += 1;
            }
        }

        self.key_index.insert(key, self.entries.len());
        self.entries.push(RecordEntry {
            data: row,
            members,
            ..Default::default()
        });
        Ok(Some(id))
    }

    fn visit_member(
        &mut self,
        die: Die<'_>,
        owner: &StructTypeRow,
        member_index: usize,
    ) -> Result<StructMemberRow, ScrapeError> {
        let mut member = StructMemberRow {
            id: self.ids.next_member_id(),
            owner: owner.id,
            line: die.decl_line(),
            ..Default::default()
        };

        let desc = self.classify_type(die.resolve_type());
        member.type_name = desc.type_name;
        member.byte_size = desc.byte_size;
        member.flags = desc.flags;
        member.array_items = desc.array_items;

        if desc.flags.is_record() {
            if let Some(record_die) = desc.record {
                let kind = if desc.flags.contains(TypeFlags::STRUCT) {
                    TypeFlags::STRUCT
                } else if desc.flags.contains(TypeFlags::UNION) {
                    TypeFlags::UNION
                } else {
                    TypeFlags::CLASS
                };
                if let Some(nested_id) = self.visit_record(record_die, kind)? {
                    assert_ne!(nested_id, 0, "nested record ID must be assigned");
                    assert_ne!(nested_id, owner.id, "record cannot nest itself");
                    member.nested = Some(nested_id);
                }
            }
        }

        // The member DIE's own byte size wins over the type's: bitfield
        // containers report their storage unit here.
        if let Some(size) = die.unsigned(gimli::DW_AT_byte_size) {
            member.byte_size = size;
        }
        member.bit_size = die.unsigned(gimli::DW_AT_bit_size);

        let data_offset = die.unsigned(gimli::DW_AT_data_member_location).unwrap_or(0);
        let mut bit_offset = die
            .unsigned(gimli::DW_AT_data_bit_offset)
            .map(|bits| data_offset * 8 + bits);
        if let Some(legacy) = die.unsigned(gimli::DW_AT_bit_offset) {
            // Legacy DWARF counts bits from the most significant end of
            // the storage unit on little-endian targets.
            let adjust = if self.arch.little_endian {
                member.byte_size * 8 - (legacy + member.bit_size.unwrap_or(0))
            } else {
                legacy
            };
            bit_offset = Some(bit_offset.unwrap_or(0) + adjust);
        }
        member.byte_offset = bit_offset.map_or(data_offset, |bits| bits / 8);
        member.bit_offset = bit_offset.map(|bits| bits % 8);

        member.name = match die.text(gimli::DW_AT_name) {
            Some(name) => name.to_owned(),
            None if owner.flags.contains(TypeFlags::UNION) => format!("<anon>@{member_index}"),
            None => {
                let mut name = format!("<anon>@{}", member.byte_offset);
                if let Some(bits) = member.bit_offset {
                    name.push_str(&format!(":{bits}"));
                }
                name
            }
        };

        Ok(member)
    }

    /// Normalises a member type to a canonical name and flag set, chasing
    /// typedefs, qualifiers and array element types. Pointers are flagged
    /// but never followed into an aggregate, so reference cycles cannot
    /// recurse.
    fn classify_type<'a>(&self, die: Option<Die<'a>>) -> TypeDesc<'a> {
        let Some(die) = die else {
            return TypeDesc {
                type_name: "void".to_owned(),
                byte_size: 0,
                flags: TypeFlags::empty(),
                array_items: None,
                record: None,
            };
        };

        match die.tag() {
            gimli::DW_TAG_base_type => TypeDesc {
                type_name: die
                    .text(gimli::DW_AT_name)
                    .unwrap_or("<unknown>")
                    .to_owned(),
                byte_size: die.unsigned(gimli::DW_AT_byte_size).unwrap_or(0),
                flags: TypeFlags::BASE,
                array_items: None,
                record: None,
            },
            gimli::DW_TAG_enumeration_type => TypeDesc {
                type_name: die
                    .text(gimli::DW_AT_name)
                    .unwrap_or("<anon enum>")
                    .to_owned(),
                byte_size: die.unsigned(gimli::DW_AT_byte_size).unwrap_or(0),
                flags: TypeFlags::ENUM,
                array_items: None,
                record: None,
            },
            gimli::DW_TAG_structure_type => self.classify_record(die, TypeFlags::STRUCT),
            gimli::DW_TAG_class_type => self.classify_record(die, TypeFlags::CLASS),
            gimli::DW_TAG_union_type => self.classify_record(die, TypeFlags::UNION),
            gimli::DW_TAG_typedef => self.classify_type(die.resolve_type()),
            gimli::DW_TAG_const_type => self.classify_qualified(die, "const"),
            gimli::DW_TAG_volatile_type => self.classify_qualified(die, "volatile"),
            gimli::DW_TAG_restrict_type => self.classify_type(die.resolve_type()),
            gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => {
                let pointee = self.classify_type(die.resolve_type());
                TypeDesc {
                    type_name: format!("{} *", pointee.type_name),
                    byte_size: die
                        .unsigned(gimli::DW_AT_byte_size)
                        .unwrap_or(DEFAULT_POINTER_SIZE),
                    flags: TypeFlags::POINTER,
                    array_items: None,
                    record: None,
                }
            }
            gimli::DW_TAG_array_type => {
                let element = self.classify_type(die.resolve_type());
                let count = array_count(die);
                let byte_size = die
                    .unsigned(gimli::DW_AT_byte_size)
                    .unwrap_or_else(|| element.byte_size * count.unwrap_or(0));
                let type_name = match count {
                    Some(n) => format!("{} [{n}]", element.type_name),
                    None => format!("{} []", element.type_name),
                };
                TypeDesc {
                    type_name,
                    byte_size,
                    flags: element.flags | TypeFlags::ARRAY,
                    array_items: count,
                    record: element.record,
                }
            }
            gimli::DW_TAG_subroutine_type => TypeDesc {
                type_name: "<subroutine>".to_owned(),
                byte_size: 0,
                flags: TypeFlags::FUNCTION,
                array_items: None,
                record: None,
            },
            other => {
                debug!(tag = ?other, offset = die.offset(), "unhandled type tag");
                TypeDesc {
                    type_name: die
                        .text(gimli::DW_AT_name)
                        .unwrap_or("<unknown>")
                        .to_owned(),
                    byte_size: die.unsigned(gimli::DW_AT_byte_size).unwrap_or(0),
                    flags: TypeFlags::empty(),
                    array_items: None,
                    record: None,
                }
            }
        }
    }

    fn classify_record<'a>(&self, die: Die<'a>, kind: TypeFlags) -> TypeDesc<'a> {
        let (name, anonymous) = self.record_name(die);
        let mut flags = kind;
        if anonymous {
            flags |= TypeFlags::ANONYMOUS;
        }
        TypeDesc {
            type_name: name,
            byte_size: die.unsigned(gimli::DW_AT_byte_size).unwrap_or(0),
            flags,
            array_items: None,
            record: Some(die),
        }
    }

    fn classify_qualified<'a>(&self, die: Die<'a>, qualifier: &str) -> TypeDesc<'a> {
        let mut desc = self.classify_type(die.resolve_type());
        // Nested aggregates keep the bare record name so that type_name
        // matches struct_type.name.
        if desc.record.is_none() {
            desc.type_name = format!("{qualifier} {}", desc.type_name);
        }
        desc
    }

    /// The record's own name, or a synthetic one for anonymous records.
    fn record_name(&self, die: Die<'_>) -> (String, bool) {
        match die.text(gimli::DW_AT_name) {
            Some(name) => (name.to_owned(), false),
            None => {
                let file = self.strip(die.decl_file().unwrap_or(""));
                let name = format!("<anon>@{}:{}:{:#x}", file, die.decl_line(), die.offset());
                (name, true)
            }
        }
    }

    fn strip(&self, file: &str) -> String {
        if let Some(prefix) = &self.strip_prefix {
            if let Ok(relative) = std::path::Path::new(file).strip_prefix(prefix) {
                return relative.display().to_string();
            }
        }
        file.to_owned()
    }

    /// Drains the per-unit working set into storage.
    fn end_unit(&mut self) -> Result<(), ScrapeError> {
        let db = Arc::clone(&self.storage);
        let mut entry_by_id: HashMap<u64, usize> = HashMap::new();

        // Transaction #1: records, then members with remapped owner and
        // nested references.
        {
            let entries = &mut self.entries;
            let summary = &mut self.summary;
            db.transaction(|tx| {
                let mut remap: HashMap<u64, u64> = HashMap::new();
                for (index, entry) in entries.iter_mut().enumerate() {
                    let local_id = entry.data.id;
                    debug_assert_ne!(local_id, 0, "unassigned local ID");
                    let (stored, fresh) = storage::insert_struct_type(tx, &entry.data)?;
                    entry.data.id = stored;
                    if fresh {
                        summary.types_inserted += 1;
                        debug!(record = %entry.data.name, id = stored, "inserted record type");
                    } else {
                        remap.insert(local_id, stored);
                        entry.skip_postprocess = true;
                        summary.dup_structs += 1;
                        debug!(record = %entry.data.name, id = stored, "record already known");
                    }
                    entry_by_id.insert(stored, index);
                }

                for entry in entries.iter_mut() {
                    let owner = entry.data.id;
                    for member in &mut entry.members {
                        member.owner = owner;
                        if let Some(nested) = member.nested {
                            if let Some(&mapped) = remap.get(&nested) {
                                assert_ne!(owner, mapped, "recursive member");
                                member.nested = Some(mapped);
                            }
                        }
                        let (stored, fresh) = storage::insert_struct_member(tx, member)?;
                        member.id = stored;
                        if fresh {
                            summary.members_inserted += 1;
                        }
                    }
                }
                Ok(())
            })?;
        }

        // Member IDs are now stable; expand the layouts.
        let format = self.arch.capability_format;
        for index in 0..self.entries.len() {
            if self.entries[index].skip_postprocess {
                continue;
            }
            layout::flatten_record(&mut self.entries, &entry_by_id, index, &format)?;
        }

        // Transaction #2: flattened bounds, layouts and alias pairs.
        let entries = &self.entries;
        db.transaction(|tx| {
            for entry in entries.iter().filter(|e| !e.skip_postprocess) {
                if entry.data.has_imprecise {
                    storage::set_has_imprecise(tx, entry.data.id)?;
                }
                storage::insert_type_layout(tx, &entry.data, entry.has_vla)?;
                for row in &entry.flattened {
                    storage::insert_member_bounds(tx, row)?;
                    storage::insert_layout_member(tx, row)?;
                }
                storage::insert_subobject_aliases(tx, entry.data.id)?;
            }
            Ok(())
        })?;

        self.entries.clear();
        self.key_index.clear();
        Ok(())
    }
}

/// Element count of an array type, from its subrange children. Multiple
/// dimensions multiply out; a dimension without bounds makes the whole
/// array unsized (a VLA).
fn array_count(die: Die<'_>) -> Option<u64> {
    let mut product: Option<u64> = None;
    for child in die.children() {
        if child.tag() != gimli::DW_TAG_subrange_type {
            continue;
        }
        let dimension = child
            .unsigned(gimli::DW_AT_count)
            .or_else(|| child.unsigned(gimli::DW_AT_upper_bound).map(|ub| ub + 1))?;
        product = Some(product.unwrap_or(1) * dimension);
    }
    product
}
