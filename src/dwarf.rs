//! gimli-backed DIE source.
//!
//! `GimliSource` opens one object file, derives the target architecture
//! from its header, and lazily materialises each `.debug_info` unit into
//! an owned [`Unit`] tree: attributes are decoded to plain values,
//! strings are resolved through the string sections, constant
//! `DW_OP_plus_uconst` member locations are folded, and declaration files
//! are rendered through the line-program file table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use gimli::{AttributeValue, EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use tracing::debug;

use crate::bounds::CapabilityFormat;
use crate::die::{Architecture, AttrValue, DieId, DieSource, Unit, UnitBuilder};
use crate::error::ScrapeError;

type Reader = EndianSlice<'static, RunTimeEndian>;

/// DIE source over an on-disk object file with DWARF debug info.
#[derive(Debug)]
pub struct GimliSource {
    path: PathBuf,
    arch: Architecture,
    dwarf: gimli::Dwarf<Reader>,
    units: gimli::DebugInfoUnitHeadersIter<Reader>,
}

impl GimliSource {
    /// Opens an object file and prepares its unit iterator.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ScrapeError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path).map_err(|source| ScrapeError::Io {
            path: path.clone(),
            source,
        })?;
        // The sections must outlive the iterator state; leaking the file
        // buffer pins them for the lifetime of the process.
        let data: &'static [u8] = Box::leak(data.into_boxed_slice());

        let object = object::File::parse(data).map_err(|err| ScrapeError::Format {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let arch = Architecture {
            little_endian: object.is_little_endian(),
            capability_format: if object.is_64() {
                CapabilityFormat::CHERI128
            } else {
                CapabilityFormat::CHERI64
            },
        };

        let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
            let section = object
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(EndianSlice::new(section, endian))
        };
        let dwarf = gimli::Dwarf::load(load_section).map_err(|err| ScrapeError::Format {
            path: path.clone(),
            reason: err.to_string(),
        })?;

        Ok(Self::from_dwarf(path, arch, dwarf))
    }

    /// Wraps an already-loaded DWARF context.
    pub fn from_dwarf(path: PathBuf, arch: Architecture, dwarf: gimli::Dwarf<Reader>) -> Self {
        let units = dwarf.units();
        GimliSource {
            path,
            arch,
            dwarf,
            units,
        }
    }

    fn convert_unit(&self, unit: &gimli::Unit<Reader>) -> Result<Unit, ScrapeError> {
        let files = self.file_table(unit);
        let mut builder = UnitBuilder::new();
        // (depth, die) of the ancestors of the current entry.
        let mut stack: Vec<(isize, DieId)> = Vec::new();
        let mut depth = 0isize;

        let mut cursor = unit.entries();
        while let Some((delta, entry)) = cursor.next_dfs()? {
            depth += delta;
            while stack.last().is_some_and(|&(d, _)| d >= depth) {
                stack.pop();
            }
            let parent = stack.last().map(|&(_, id)| id);
            let id = builder.add_with_offset(parent, entry.tag(), entry.offset().0 as u64);

            let mut decl_file_index = None;
            let mut attrs = entry.attrs();
            while let Some(attr) = attrs.next()? {
                match attr.name() {
                    gimli::DW_AT_decl_file => decl_file_index = attr.udata_value(),
                    gimli::DW_AT_decl_line => {
                        if let Some(line) = attr.udata_value() {
                            builder.decl_line(id, line);
                        }
                    }
                    name => {
                        if let Some(value) = self.convert_attr(unit, &attr) {
                            builder.attr(id, name, value);
                        }
                    }
                }
            }
            if let Some(file) = decl_file_index.and_then(|index| files.get(&index)) {
                builder.decl_file(id, file);
            }
            stack.push((depth, id));
        }
        Ok(builder.finish())
    }

    fn convert_attr(
        &self,
        unit: &gimli::Unit<Reader>,
        attr: &gimli::Attribute<Reader>,
    ) -> Option<AttrValue> {
        if let Some(value) = attr.udata_value() {
            return Some(AttrValue::Unsigned(value));
        }
        if let Some(value) = attr.sdata_value() {
            return Some(AttrValue::Signed(value));
        }
        match attr.value() {
            AttributeValue::Flag(flag) => Some(AttrValue::Flag(flag)),
            AttributeValue::UnitRef(offset) => Some(AttrValue::Ref(offset.0 as u64)),
            // Section-relative references are resolvable only when they
            // land inside this unit; anything else stays unresolved.
            AttributeValue::DebugInfoRef(offset) => offset
                .to_unit_offset(&unit.header)
                .map(|local| AttrValue::Ref(local.0 as u64)),
            AttributeValue::Exprloc(expression) => {
                exprloc_constant(expression, unit.encoding()).map(AttrValue::Unsigned)
            }
            value @ (AttributeValue::String(_)
            | AttributeValue::DebugStrRef(_)
            | AttributeValue::DebugLineStrRef(_)
            | AttributeValue::DebugStrOffsetsIndex(_)) => self
                .dwarf
                .attr_string(unit, value)
                .ok()
                .map(|raw| AttrValue::Text(raw.to_string_lossy().into_owned())),
            other => {
                debug!(attr = ?attr.name(), value = ?other, "attribute form not decoded");
                None
            }
        }
    }

    /// Absolute paths of the unit's line-program file table, keyed by the
    /// raw `DW_AT_decl_file` index.
    fn file_table(&self, unit: &gimli::Unit<Reader>) -> HashMap<u64, String> {
        let mut files = HashMap::new();
        let Some(program) = &unit.line_program else {
            return files;
        };
        let header = program.header();
        let comp_dir = unit
            .comp_dir
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();

        let count = header.file_names().len() as u64;
        let base = if header.version() >= 5 { 0 } else { 1 };
        for index in base..base + count {
            let Some(file) = header.file(index) else {
                continue;
            };
            let mut path = PathBuf::from(&comp_dir);
            if let Some(dir) = file
                .directory(header)
                .and_then(|dir| self.dwarf.attr_string(unit, dir).ok())
                .map(|raw| raw.to_string_lossy().into_owned())
            {
                let dir = Path::new(&dir);
                if dir.is_absolute() {
                    path = dir.to_path_buf();
                } else {
                    path.push(dir);
                }
            }
            let Ok(name) = self.dwarf.attr_string(unit, file.path_name()) else {
                continue;
            };
            let name = name.to_string_lossy();
            path.push(name.as_ref());
            files.insert(index, path.display().to_string());
        }
        files
    }
}

impl DieSource for GimliSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn next_unit(&mut self) -> Result<Option<Unit>, ScrapeError> {
        let Some(header) = self.units.next()? else {
            return Ok(None);
        };
        let unit = self.dwarf.unit(header)?;
        Ok(Some(self.convert_unit(&unit)?))
    }
}

/// Folds a one-operation location expression to its constant, the form
/// compilers emit for `DW_AT_data_member_location`.
fn exprloc_constant(expression: gimli::Expression<Reader>, encoding: gimli::Encoding) -> Option<u64> {
    let mut operations = expression.operations(encoding);
    let first = operations.next().ok()??;
    if operations.next().ok()?.is_some() {
        return None;
    }
    match first {
        gimli::read::Operation::PlusConstant { value } => Some(value),
        gimli::read::Operation::UnsignedConstant { value } => Some(value),
        _ => None,
    }
}
