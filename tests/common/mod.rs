//! Common test utilities for caplayout integration tests.
//!
//! Builds synthetic DIE trees standing in for the sample binaries and
//! provides an in-memory [`DieSource`] to drive the walker with them.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use caplayout::bounds::CapabilityFormat;
use caplayout::die::{Architecture, AttrValue, DieId, DieSource, Unit, UnitBuilder};
use caplayout::model::{IdAllocator, ScrapeSummary};
use caplayout::pool::CancellationToken;
use caplayout::storage::Storage;
use caplayout::walker::StructLayoutScraper;
use caplayout::ScrapeError;

/// A `DieSource` over pre-built units.
pub struct FakeSource {
    path: PathBuf,
    arch: Architecture,
    units: std::vec::IntoIter<Unit>,
}

impl FakeSource {
    pub fn new(name: &str, units: Vec<Unit>) -> Self {
        FakeSource {
            path: PathBuf::from(name),
            arch: Architecture {
                little_endian: true,
                capability_format: CapabilityFormat::CHERI128,
            },
            units: units.into_iter(),
        }
    }

    pub fn with_arch(mut self, arch: Architecture) -> Self {
        self.arch = arch;
        self
    }
}

impl DieSource for FakeSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn next_unit(&mut self) -> Result<Option<Unit>, ScrapeError> {
        Ok(self.units.next())
    }
}

/// Starts a unit with a named `DW_TAG_compile_unit` root.
pub fn unit(name: &str) -> (UnitBuilder, DieId) {
    let mut b = UnitBuilder::new();
    let root = b.add(None, gimli::DW_TAG_compile_unit);
    b.attr(root, gimli::DW_AT_name, AttrValue::Text(name.into()));
    (b, root)
}

pub fn base_type(b: &mut UnitBuilder, root: DieId, name: &str, size: u64) -> DieId {
    let die = b.add(Some(root), gimli::DW_TAG_base_type);
    b.attr(die, gimli::DW_AT_name, AttrValue::Text(name.into()));
    b.attr(die, gimli::DW_AT_byte_size, AttrValue::Unsigned(size));
    die
}

pub fn record(
    b: &mut UnitBuilder,
    root: DieId,
    tag: gimli::DwTag,
    name: Option<&str>,
    size: u64,
    file: &str,
    line: u64,
) -> DieId {
    let die = b.add(Some(root), tag);
    if let Some(name) = name {
        b.attr(die, gimli::DW_AT_name, AttrValue::Text(name.into()));
    }
    b.attr(die, gimli::DW_AT_byte_size, AttrValue::Unsigned(size));
    b.decl(die, file, line);
    die
}

pub fn member(
    b: &mut UnitBuilder,
    parent: DieId,
    name: Option<&str>,
    ty: DieId,
    offset: u64,
) -> DieId {
    let die = b.add(Some(parent), gimli::DW_TAG_member);
    if let Some(name) = name {
        b.attr(die, gimli::DW_AT_name, AttrValue::Text(name.into()));
    }
    let ty_offset = b.offset_of(ty);
    b.attr(die, gimli::DW_AT_type, AttrValue::Ref(ty_offset));
    b.attr(die, gimli::DW_AT_data_member_location, AttrValue::Unsigned(offset));
    die
}

/// Array type without subrange bounds: a VLA tail.
pub fn vla_array(b: &mut UnitBuilder, root: DieId, element: DieId) -> DieId {
    let array = b.add(Some(root), gimli::DW_TAG_array_type);
    let elem_offset = b.offset_of(element);
    b.attr(array, gimli::DW_AT_type, AttrValue::Ref(elem_offset));
    b.add(Some(array), gimli::DW_TAG_subrange_type);
    array
}

pub fn sized_array(b: &mut UnitBuilder, root: DieId, element: DieId, count: u64) -> DieId {
    let array = b.add(Some(root), gimli::DW_TAG_array_type);
    let elem_offset = b.offset_of(element);
    b.attr(array, gimli::DW_AT_type, AttrValue::Ref(elem_offset));
    let subrange = b.add(Some(array), gimli::DW_TAG_subrange_type);
    b.attr(subrange, gimli::DW_AT_count, AttrValue::Unsigned(count));
    array
}

/// `struct struct_with_vla { long value; char vla[]; }`
pub fn sample_struct_vla_unit() -> Unit {
    let (mut b, root) = unit("vla.c");
    let long_ty = base_type(&mut b, root, "long", 8);
    let char_ty = base_type(&mut b, root, "char", 1);
    let vla_ty = vla_array(&mut b, root, char_ty);

    let s = record(
        &mut b,
        root,
        gimli::DW_TAG_structure_type,
        Some("struct_with_vla"),
        8,
        "/src/vla.c",
        10,
    );
    member(&mut b, s, Some("value"), long_ty, 0);
    member(&mut b, s, Some("vla"), vla_ty, 8);
    b.finish()
}

/// `struct inner_with_vla { long value; char vla[]; };`
/// `struct nested_with_vla { struct inner_with_vla inner; }`
pub fn sample_nested_struct_vla_unit() -> Unit {
    let (mut b, root) = unit("nested.c");
    let long_ty = base_type(&mut b, root, "long", 8);
    let char_ty = base_type(&mut b, root, "char", 1);
    let vla_ty = vla_array(&mut b, root, char_ty);

    let inner = record(
        &mut b,
        root,
        gimli::DW_TAG_structure_type,
        Some("inner_with_vla"),
        8,
        "/src/nested.c",
        5,
    );
    member(&mut b, inner, Some("value"), long_ty, 0);
    member(&mut b, inner, Some("vla"), vla_ty, 8);

    let outer = record(
        &mut b,
        root,
        gimli::DW_TAG_structure_type,
        Some("nested_with_vla"),
        8,
        "/src/nested.c",
        12,
    );
    member(&mut b, outer, Some("inner"), inner, 0);
    b.finish()
}

/// `union union_with_vla { long value; char vla[]; }` plus
/// `union union_with_vla_mix { long value; char vla[0]; }`
pub fn sample_union_vla_unit() -> Unit {
    let (mut b, root) = unit("union.c");
    let long_ty = base_type(&mut b, root, "long", 8);
    let char_ty = base_type(&mut b, root, "char", 1);
    let open_vla = vla_array(&mut b, root, char_ty);
    let zero_vla = sized_array(&mut b, root, char_ty, 0);

    let u = record(
        &mut b,
        root,
        gimli::DW_TAG_union_type,
        Some("union_with_vla"),
        8,
        "/src/union.c",
        3,
    );
    member(&mut b, u, Some("value"), long_ty, 0);
    member(&mut b, u, Some("vla"), open_vla, 0);

    let mix = record(
        &mut b,
        root,
        gimli::DW_TAG_union_type,
        Some("union_with_vla_mix"),
        8,
        "/src/union.c",
        9,
    );
    member(&mut b, mix, Some("value"), long_ty, 0);
    member(&mut b, mix, Some("vla"), zero_vla, 0);
    b.finish()
}

/// Runs one scraper over `units` against `storage` with a fresh ID
/// allocator, returning its summary. Panics on walker failure.
pub fn scrape_units(input: &str, units: Vec<Unit>, storage: &Arc<Storage>) -> ScrapeSummary {
    let ids = Arc::new(IdAllocator::new());
    scrape_units_with(input, units, storage, &ids)
}

pub fn scrape_units_with(
    input: &str,
    units: Vec<Unit>,
    storage: &Arc<Storage>,
    ids: &Arc<IdAllocator>,
) -> ScrapeSummary {
    let source = FakeSource::new(input, units);
    let mut scraper =
        StructLayoutScraper::new(source, Arc::clone(storage), Arc::clone(ids), None);
    scraper.init_schema().unwrap();
    scraper.run(&CancellationToken::new()).unwrap();
    scraper.into_summary()
}

pub fn open_storage() -> Arc<Storage> {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    storage.init_schema().unwrap();
    storage
}
