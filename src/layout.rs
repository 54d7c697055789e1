//! Flattened record layouts.
//!
//! For every record the flattener enumerates each directly and
//! transitively nested member with its cumulative byte offset, a
//! `::`-joined name rooted at the top-level record, and the representable
//! capability bounds for the member's extent. A member that is itself an
//! aggregate contributes its own row first, followed by the expanded rows
//! of the nested record.

use std::collections::HashMap;

use crate::bounds::CapabilityFormat;
use crate::error::ScrapeError;
use crate::model::{FlatMemberRow, RecordEntry, StructMemberRow};

/// Populates `entries[index].flattened` (and the per-record
/// `has_imprecise`/`has_vla` aggregates), recursing into nested records
/// first. Layouts are memoised: an entry that already has a flattened
/// layout is left untouched.
pub fn flatten_record(
    entries: &mut [RecordEntry],
    entry_by_id: &HashMap<u64, usize>,
    index: usize,
    format: &CapabilityFormat,
) -> Result<(), ScrapeError> {
    if !entries[index].flattened.is_empty() {
        return Ok(());
    }

    // Nested layouts must exist before this record can expand them.
    let nested_ids: Vec<u64> = entries[index]
        .members
        .iter()
        .filter_map(|m| m.nested)
        .collect();
    for id in nested_ids {
        if let Some(&nested_index) = entry_by_id.get(&id) {
            if nested_index != index {
                flatten_record(entries, entry_by_id, nested_index, format)?;
            }
        }
    }

    let mut rows = Vec::new();
    let mut has_imprecise = false;
    let mut has_vla = false;
    {
        let entry = &entries[index];
        let owner = entry.data.id;
        for member in &entry.members {
            let flat_name = format!("{}::{}", entry.data.name, member.name);
            rows.push(member_row(format, owner, member, member.byte_offset, flat_name.clone())?);

            if let Some(nested_id) = member.nested {
                let Some(&nested_index) = entry_by_id.get(&nested_id) else {
                    tracing::warn!(
                        nested_id,
                        member = %flat_name,
                        "nested record is not part of this compilation unit"
                    );
                    continue;
                };
                let nested = &entries[nested_index];
                for row in &nested.flattened {
                    let suffix = &row.name[nested.data.name.len()..];
                    let mut copy = row.clone();
                    copy.owner = owner;
                    copy.offset += member.byte_offset;
                    copy.name = format!("{flat_name}{suffix}");
                    recompute_bounds(format, &mut copy)?;
                    rows.push(copy);
                }
            }
        }
        for row in &rows {
            has_imprecise |= row.is_imprecise;
            has_vla |= row.is_vla;
        }
    }

    let entry = &mut entries[index];
    entry.flattened = rows;
    entry.data.has_imprecise = has_imprecise;
    entry.has_vla = has_vla;
    Ok(())
}

fn member_row(
    format: &CapabilityFormat,
    owner: u64,
    member: &StructMemberRow,
    offset: u64,
    name: String,
) -> Result<FlatMemberRow, ScrapeError> {
    let mut row = FlatMemberRow {
        owner,
        member: member.id,
        name,
        type_name: member.type_name.clone(),
        offset,
        byte_size: member.byte_size,
        length: member.requested_length(),
        base: 0,
        top: 0,
        is_imprecise: false,
        required_precision: 0,
        is_vla: member.is_vla(),
    };
    recompute_bounds(format, &mut row)?;
    Ok(row)
}

/// Derives `(base, top, precision, is_imprecise)` from the row's current
/// cumulative offset and requested length.
fn recompute_bounds(format: &CapabilityFormat, row: &mut FlatMemberRow) -> Result<(), ScrapeError> {
    let (base, enclosed) = format.find_representable_range(row.offset, row.length)?;
    row.base = base;
    row.top = base + enclosed;
    row.required_precision = format.find_required_precision(row.offset, row.length)?;
    row.is_imprecise = base != row.offset || enclosed != row.length;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StructTypeRow, TypeFlags};

    fn record(id: u64, name: &str, size: u64) -> RecordEntry {
        RecordEntry {
            data: StructTypeRow {
                id,
                file: "t.c".into(),
                line: 1,
                name: name.into(),
                size,
                flags: TypeFlags::STRUCT,
                has_imprecise: false,
            },
            ..Default::default()
        }
    }

    fn scalar(id: u64, owner: u64, name: &str, offset: u64, size: u64) -> StructMemberRow {
        StructMemberRow {
            id,
            owner,
            name: name.into(),
            type_name: "long".into(),
            byte_size: size,
            byte_offset: offset,
            flags: TypeFlags::BASE,
            ..Default::default()
        }
    }

    #[test]
    fn test_flatten_nested_prefixes_and_offsets() {
        // outer { long head; inner nest; } / inner { long a; long b; }
        let mut inner = record(3, "inner", 16);
        inner.members = vec![scalar(10, 3, "a", 0, 8), scalar(11, 3, "b", 8, 8)];
        let mut outer = record(2, "outer", 24);
        outer.members = vec![scalar(12, 2, "head", 0, 8), {
            let mut m = scalar(13, 2, "nest", 8, 16);
            m.type_name = "inner".into();
            m.flags = TypeFlags::STRUCT;
            m.nested = Some(3);
            m
        }];

        let mut entries = vec![outer, inner];
        let by_id = HashMap::from([(2u64, 0usize), (3u64, 1usize)]);
        flatten_record(&mut entries, &by_id, 0, &CapabilityFormat::CHERI128).unwrap();

        let names: Vec<_> = entries[0].flattened.iter().map(|r| r.name.clone()).collect();
        assert_eq!(
            names,
            vec!["outer::head", "outer::nest", "outer::nest::a", "outer::nest::b"]
        );
        let offsets: Vec<_> = entries[0].flattened.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 8, 8, 16]);
        // Every row belongs to the top-level record.
        assert!(entries[0].flattened.iter().all(|r| r.owner == 2));
        // Expanded rows kept the member reference of the inner record.
        assert_eq!(entries[0].flattened[2].member, 10);
    }

    #[test]
    fn test_flatten_recomputes_bounds_at_shifted_offset() {
        let mut inner = record(3, "inner", 0x100008);
        inner.members = vec![
            scalar(10, 3, "small", 0, 8),
            scalar(11, 3, "big", 8, 0x100000),
        ];
        let mut outer = record(2, "outer", 0x100010);
        outer.members = vec![{
            let mut m = scalar(12, 2, "nest", 8, 0x100008);
            m.flags = TypeFlags::STRUCT;
            m.nested = Some(3);
            m
        }];

        let mut entries = vec![outer, inner];
        let by_id = HashMap::from([(2u64, 0usize), (3u64, 1usize)]);
        flatten_record(&mut entries, &by_id, 0, &CapabilityFormat::CHERI128).unwrap();

        for row in &entries[0].flattened {
            assert!(row.base <= row.offset, "{}", row.name);
            assert!(row.offset + row.length <= row.top, "{}", row.name);
        }
    }

    #[test]
    fn test_has_vla_propagates_from_nested() {
        let mut inner = record(3, "inner", 8);
        inner.members = vec![scalar(10, 3, "value", 0, 8), {
            let mut m = scalar(11, 3, "vla", 8, 0);
            m.flags = TypeFlags::BASE | TypeFlags::ARRAY;
            m.array_items = None;
            m
        }];
        let mut outer = record(2, "outer", 8);
        outer.members = vec![{
            let mut m = scalar(12, 2, "nest", 0, 8);
            m.flags = TypeFlags::STRUCT;
            m.nested = Some(3);
            m
        }];

        let mut entries = vec![outer, inner];
        let by_id = HashMap::from([(2u64, 0usize), (3u64, 1usize)]);
        flatten_record(&mut entries, &by_id, 0, &CapabilityFormat::CHERI128).unwrap();
        flatten_record(&mut entries, &by_id, 1, &CapabilityFormat::CHERI128).unwrap();

        assert!(entries[0].has_vla);
        assert!(entries[1].has_vla);
        assert!(!entries[0].flattened[0].is_vla, "the aggregate member itself is not a VLA");
        assert!(entries[0].flattened.iter().any(|r| r.name == "outer::nest::vla" && r.is_vla));
    }
}
