//! Owned debug-info-entry (DIE) trees.
//!
//! The walker does not consume gimli entries directly: each compilation
//! unit is materialised into an owned arena of DIEs first, so the walker
//! only ever sees `Unit`/`Die` values with plain attribute lookups and
//! unit-local reference resolution. The gimli adapter in [`crate::dwarf`]
//! and the test fixtures both produce these through [`UnitBuilder`].

use std::collections::HashMap;
use std::path::Path;

use gimli::{DwAt, DwTag};

use crate::bounds::CapabilityFormat;
use crate::error::ScrapeError;

/// Target properties a DIE source exposes to the bounds engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Architecture {
    pub little_endian: bool,
    pub capability_format: CapabilityFormat,
}

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    Flag(bool),
    /// Unit-local reference to another DIE, by its section offset.
    Ref(u64),
}

#[derive(Debug, Clone)]
struct DieData {
    tag: DwTag,
    offset: u64,
    attrs: Vec<(DwAt, AttrValue)>,
    children: Vec<usize>,
    decl_file: Option<String>,
    decl_line: u64,
}

/// One compilation unit as an arena of DIEs. Index 0 is the unit root.
#[derive(Debug, Clone, Default)]
pub struct Unit {
    dies: Vec<DieData>,
    by_offset: HashMap<u64, usize>,
}

impl Unit {
    /// The unit root DIE (normally `DW_TAG_compile_unit`).
    pub fn root(&self) -> Die<'_> {
        Die { unit: self, index: 0 }
    }

    /// All DIEs of the unit in depth-first order, root included.
    pub fn dies(&self) -> impl Iterator<Item = Die<'_>> + '_ {
        (0..self.dies.len()).map(move |index| Die { unit: self, index })
    }

    /// Looks up a DIE by its section offset.
    pub fn die_at(&self, offset: u64) -> Option<Die<'_>> {
        self.by_offset
            .get(&offset)
            .map(|&index| Die { unit: self, index })
    }

    pub fn is_empty(&self) -> bool {
        self.dies.is_empty()
    }
}

/// A cheap handle to one DIE inside a [`Unit`].
#[derive(Clone, Copy)]
pub struct Die<'a> {
    unit: &'a Unit,
    index: usize,
}

impl<'a> Die<'a> {
    fn data(&self) -> &'a DieData {
        &self.unit.dies[self.index]
    }

    pub fn tag(&self) -> DwTag {
        self.data().tag
    }

    pub fn offset(&self) -> u64 {
        self.data().offset
    }

    pub fn find(&self, at: DwAt) -> Option<&'a AttrValue> {
        self.data()
            .attrs
            .iter()
            .find(|(name, _)| *name == at)
            .map(|(_, value)| value)
    }

    pub fn has(&self, at: DwAt) -> bool {
        self.find(at).is_some()
    }

    /// Attribute as an unsigned integer, if it has an integral form.
    pub fn unsigned(&self, at: DwAt) -> Option<u64> {
        match self.find(at)? {
            AttrValue::Unsigned(v) => Some(*v),
            AttrValue::Signed(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn text(&self, at: DwAt) -> Option<&'a str> {
        match self.find(at)? {
            AttrValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn children(&self) -> impl Iterator<Item = Die<'a>> + 'a {
        let unit = self.unit;
        self.data()
            .children
            .iter()
            .map(move |&index| Die { unit, index })
    }

    /// Follows a reference-valued attribute to its target DIE.
    pub fn resolve_ref(&self, at: DwAt) -> Option<Die<'a>> {
        match self.find(at)? {
            AttrValue::Ref(offset) => self.unit.die_at(*offset),
            _ => None,
        }
    }

    /// The DIE named by `DW_AT_type`, if any.
    pub fn resolve_type(&self) -> Option<Die<'a>> {
        self.resolve_ref(gimli::DW_AT_type)
    }

    /// Absolute declaration file path, when the producer recorded one.
    pub fn decl_file(&self) -> Option<&'a str> {
        self.data().decl_file.as_deref()
    }

    pub fn decl_line(&self) -> u64 {
        self.data().decl_line
    }
}

impl std::fmt::Debug for Die<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Die")
            .field("tag", &self.tag())
            .field("offset", &self.offset())
            .finish()
    }
}

/// Handle returned by [`UnitBuilder::add`] for attaching attributes and
/// children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DieId(usize);

/// Incremental construction of a [`Unit`].
///
/// Offsets can be supplied (the gimli adapter uses real section offsets)
/// or left to the builder, which assigns synthetic ones.
#[derive(Debug, Default)]
pub struct UnitBuilder {
    dies: Vec<DieData>,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a DIE with a synthetic offset. The first DIE added becomes
    /// the unit root and must not have a parent.
    pub fn add(&mut self, parent: Option<DieId>, tag: DwTag) -> DieId {
        let offset = (self.dies.len() as u64 + 1) * 0x10;
        self.add_with_offset(parent, tag, offset)
    }

    pub fn add_with_offset(&mut self, parent: Option<DieId>, tag: DwTag, offset: u64) -> DieId {
        let index = self.dies.len();
        self.dies.push(DieData {
            tag,
            offset,
            attrs: Vec::new(),
            children: Vec::new(),
            decl_file: None,
            decl_line: 0,
        });
        if let Some(DieId(p)) = parent {
            self.dies[p].children.push(index);
        }
        DieId(index)
    }

    pub fn attr(&mut self, die: DieId, at: DwAt, value: AttrValue) {
        self.dies[die.0].attrs.push((at, value));
    }

    pub fn offset_of(&self, die: DieId) -> u64 {
        self.dies[die.0].offset
    }

    pub fn decl(&mut self, die: DieId, file: &str, line: u64) {
        self.decl_file(die, file);
        self.decl_line(die, line);
    }

    pub fn decl_file(&mut self, die: DieId, file: &str) {
        self.dies[die.0].decl_file = Some(file.to_owned());
    }

    pub fn decl_line(&mut self, die: DieId, line: u64) {
        self.dies[die.0].decl_line = line;
    }

    pub fn finish(self) -> Unit {
        let by_offset = self
            .dies
            .iter()
            .enumerate()
            .map(|(index, die)| (die.offset, index))
            .collect();
        Unit {
            dies: self.dies,
            by_offset,
        }
    }
}

/// A producer of compilation units for one input binary.
///
/// The unit sequence is forward-only and not restartable; implementations
/// are expected to parse lazily so cancellation between units stays cheap.
pub trait DieSource {
    /// Path of the underlying input, for diagnostics.
    fn path(&self) -> &Path;

    /// Target architecture of the input.
    fn architecture(&self) -> Architecture;

    /// The next compilation unit, or `None` when exhausted.
    fn next_unit(&mut self) -> Result<Option<Unit>, ScrapeError>;
}
