//! SQLite storage for scraped layouts.
//!
//! The schema is simple and relational: records, members, flattened
//! member bounds, and the alias pairs derived from them. Deduplication is
//! done with UNIQUE constraints and `ON CONFLICT DO NOTHING RETURNING id`
//! inserts; when the insert returns no row, a follow-up select by the
//! identity columns retrieves the already-stored ID.
//!
//! One connection is shared by every worker of a run. A transaction holds
//! the connection lock for its whole scope, so multi-statement work from
//! different workers never interleaves. Transactions must not nest.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{named_params, params, Connection, OptionalExtension, Transaction};

use crate::error::ScrapeError;
use crate::model::{FlatMemberRow, StructMemberRow, StructTypeRow};

/// Complete schema. Idempotent: every object is `IF NOT EXISTS`.
pub const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

-- Structures, unions and classes. Two records are considered the same
-- when they have the same name and are defined in the same file at the
-- same line.
CREATE TABLE IF NOT EXISTS struct_type (
    id INTEGER NOT NULL PRIMARY KEY,
    -- File where the record is defined
    file TEXT NOT NULL,
    -- Line where the record is defined
    line INTEGER NOT NULL,
    -- Name of the type; anonymous records get a synthetic name
    name TEXT,
    -- Size of the record including any padding
    size INTEGER NOT NULL,
    -- Struct/union/class/anonymous classification
    flags INTEGER DEFAULT 0 NOT NULL,
    -- Set when at least one member is not precisely representable by a
    -- sub-object capability
    has_imprecise BOOLEAN DEFAULT 0,
    UNIQUE(name, file, line)
);

-- One row per member, owned by a struct_type row. Members that are
-- themselves aggregates also reference the nested record.
CREATE TABLE IF NOT EXISTS struct_member (
    id INTEGER NOT NULL PRIMARY KEY,
    owner INTEGER NOT NULL,
    nested INTEGER,
    -- Member name; anonymous members get a synthetic name
    name TEXT NOT NULL,
    -- Type name; for nested records this matches struct_type.name
    type_name TEXT NOT NULL,
    line INTEGER NOT NULL,
    -- Size in bytes, possibly including internal padding
    size INTEGER NOT NULL,
    -- Bit remainder of the size, bitfields only
    bit_size INTEGER,
    -- Offset in bytes from the start of the owner
    offset INTEGER NOT NULL,
    -- Bit remainder of the offset, bitfields only
    bit_offset INTEGER,
    flags INTEGER DEFAULT 0 NOT NULL,
    array_items INTEGER,
    FOREIGN KEY (owner) REFERENCES struct_type (id),
    FOREIGN KEY (nested) REFERENCES struct_type (id),
    UNIQUE(owner, name, offset),
    CHECK(owner != nested)
);

-- Representable capability bounds for every directly or transitively
-- nested member of a record.
CREATE TABLE IF NOT EXISTS member_bounds (
    id INTEGER NOT NULL PRIMARY KEY,
    -- Top-level record this flattened entry belongs to
    owner INTEGER NOT NULL,
    -- "::"-joined name of the flattened entry
    name TEXT NOT NULL,
    -- Member row this entry was expanded from
    member INTEGER NOT NULL,
    -- Cumulative offset from the start of the owner
    offset INTEGER NOT NULL,
    -- Representable sub-object base
    base INTEGER NOT NULL,
    -- Representable sub-object top
    top INTEGER NOT NULL,
    -- Set when the member is not precisely representable
    is_imprecise BOOL DEFAULT 0,
    -- Mantissa bits needed to represent the member exactly
    precision INTEGER,
    FOREIGN KEY (owner) REFERENCES struct_type (id),
    FOREIGN KEY (member) REFERENCES struct_member (id)
);

-- Pairs of flattened entries where the widened bounds of one capability
-- reach into the bytes of another member.
CREATE TABLE IF NOT EXISTS subobject_alias (
    subobj INTEGER NOT NULL,
    alias INTEGER NOT NULL,
    PRIMARY KEY (subobj, alias),
    FOREIGN KEY (subobj) REFERENCES member_bounds (id),
    FOREIGN KEY (alias) REFERENCES member_bounds (id)
);

-- Candidate alias pairs: distinct member_bounds rows of the same owner
-- whose byte ranges overlap and whose names are not nested in each other.
CREATE VIEW IF NOT EXISTS alias_bounds AS
WITH impl (
    owner, id, alias_id, name, alias_name, base, check_base, top, check_top
) AS (
    SELECT
        mb.owner,
        mb.id,
        alb.id AS alias_id,
        mb.name,
        alb.name AS alias_name,
        mb.base,
        alb.offset AS check_base,
        mb.top,
        (alb.offset + alm.size + IIF(alm.bit_size, 1, 0)) AS check_top
    FROM member_bounds alb
        JOIN struct_member alm ON alb.member = alm.id
        JOIN member_bounds mb ON
            mb.owner = alb.owner AND mb.id != alb.id
)
SELECT owner, id AS subobj_id, alias_id
FROM impl
WHERE
    MAX(check_base, base) < MIN(check_top, top) AND
    NOT (name LIKE alias_name || '%') AND
    NOT (alias_name LIKE name || '%');

-- Flat layout keyed like struct_type and sharing its id, tracking
-- variable-length-array tail members.
CREATE TABLE IF NOT EXISTS type_layout (
    id INTEGER NOT NULL PRIMARY KEY,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    name TEXT,
    size INTEGER NOT NULL,
    -- Set when any flattened member is a VLA
    has_vla BOOLEAN DEFAULT 0,
    UNIQUE(name, file, line)
);

-- One row per flattened member of a type_layout record.
CREATE TABLE IF NOT EXISTS layout_member (
    id INTEGER NOT NULL PRIMARY KEY,
    owner INTEGER NOT NULL,
    -- "::"-joined name of the flattened entry
    name TEXT NOT NULL,
    type_name TEXT NOT NULL,
    -- Cumulative offset from the start of the owner
    offset INTEGER NOT NULL,
    size INTEGER NOT NULL,
    -- Array member with absent or zero element count
    is_vla BOOLEAN DEFAULT 0,
    FOREIGN KEY (owner) REFERENCES type_layout (id)
);
"#;

/// Shared handle to the layout database.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Opens (or creates) the database file. `:memory:` is accepted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ScrapeError> {
        let conn = Connection::open(path.as_ref())?;
        Ok(Storage {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, ScrapeError> {
        Ok(Storage {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Creates all tables and views. Safe to call more than once.
    pub fn init_schema(&self) -> Result<(), ScrapeError> {
        self.lock().execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Runs `f` inside a transaction holding the connection lock.
    /// Commits when `f` returns `Ok`, rolls back otherwise. Must not be
    /// called re-entrantly: nested transactions deadlock by design.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, ScrapeError>,
    ) -> Result<T, ScrapeError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Direct read access, for queries outside the walker write path.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// Inserts a record row, reusing the stored ID when the identity already
/// exists. Returns `(stored_id, freshly_inserted)`.
pub fn insert_struct_type(
    conn: &Connection,
    row: &StructTypeRow,
) -> Result<(u64, bool), ScrapeError> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO struct_type (id, file, line, name, size, flags) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT DO NOTHING RETURNING id",
    )?;
    let inserted: Option<u64> = insert
        .query_row(
            params![row.id, row.file, row.line, row.name, row.size, row.flags.bits()],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = inserted {
        return Ok((id, true));
    }
    let mut select = conn.prepare_cached(
        "SELECT id FROM struct_type WHERE file = ?1 AND line = ?2 AND name = ?3",
    )?;
    let id = select.query_row(params![row.file, row.line, row.name], |r| r.get(0))?;
    Ok((id, false))
}

/// Inserts a member row; on identity conflict the stored ID is fetched.
pub fn insert_struct_member(
    conn: &Connection,
    row: &StructMemberRow,
) -> Result<(u64, bool), ScrapeError> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO struct_member (\
           id, owner, nested, name, type_name, line, size, \
           bit_size, offset, bit_offset, flags, array_items\
         ) VALUES (\
           :id, :owner, :nested, :name, :type_name, :line, :size, \
           :bit_size, :offset, :bit_offset, :flags, :array_items) \
         ON CONFLICT DO NOTHING RETURNING id",
    )?;
    let inserted: Option<u64> = insert
        .query_row(
            named_params! {
                ":id": row.id,
                ":owner": row.owner,
                ":nested": row.nested,
                ":name": row.name,
                ":type_name": row.type_name,
                ":line": row.line,
                ":size": row.byte_size,
                ":bit_size": row.bit_size,
                ":offset": row.byte_offset,
                ":bit_offset": row.bit_offset,
                ":flags": row.flags.bits(),
                ":array_items": row.array_items,
            },
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = inserted {
        return Ok((id, true));
    }
    let mut select = conn.prepare_cached(
        "SELECT id FROM struct_member WHERE owner = ?1 AND name = ?2 AND offset = ?3",
    )?;
    let id = select.query_row(params![row.owner, row.name, row.byte_offset], |r| r.get(0))?;
    Ok((id, false))
}

pub fn insert_member_bounds(conn: &Connection, row: &FlatMemberRow) -> Result<(), ScrapeError> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO member_bounds (\
           owner, member, offset, name, base, top, is_imprecise, precision) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    insert.execute(params![
        row.owner,
        row.member,
        row.offset,
        row.name,
        row.base,
        row.top,
        row.is_imprecise,
        row.required_precision,
    ])?;
    Ok(())
}

/// Marks a record as carrying at least one imprecisely representable
/// member. Only ever called for records inserted by the current unit.
pub fn set_has_imprecise(conn: &Connection, owner: u64) -> Result<(), ScrapeError> {
    let mut update =
        conn.prepare_cached("UPDATE struct_type SET has_imprecise = 1 WHERE id = ?1")?;
    update.execute(params![owner])?;
    Ok(())
}

/// Materialises the alias pairs of one record from the `alias_bounds`
/// view.
pub fn insert_subobject_aliases(conn: &Connection, owner: u64) -> Result<(), ScrapeError> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO subobject_alias (subobj, alias) \
           SELECT ab.subobj_id AS subobj, ab.alias_id AS alias \
           FROM alias_bounds ab \
           WHERE ab.owner = ?1",
    )?;
    insert.execute(params![owner])?;
    Ok(())
}

pub fn insert_type_layout(
    conn: &Connection,
    row: &StructTypeRow,
    has_vla: bool,
) -> Result<(), ScrapeError> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO type_layout (id, file, line, name, size, has_vla) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT DO NOTHING",
    )?;
    insert.execute(params![row.id, row.file, row.line, row.name, row.size, has_vla])?;
    Ok(())
}

pub fn insert_layout_member(conn: &Connection, row: &FlatMemberRow) -> Result<(), ScrapeError> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO layout_member (owner, name, type_name, offset, size, is_vla) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    insert.execute(params![
        row.owner,
        row.name,
        row.type_name,
        row.offset,
        row.byte_size,
        row.is_vla,
    ])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TypeFlags;

    fn test_row(name: &str) -> StructTypeRow {
        StructTypeRow {
            id: 2,
            file: "a.c".into(),
            line: 10,
            name: name.into(),
            size: 16,
            flags: TypeFlags::STRUCT,
            has_imprecise: false,
        }
    }

    #[test]
    fn test_schema_creation_is_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        storage.init_schema().unwrap();
        storage.init_schema().unwrap();

        storage.with_connection(|conn| {
            for table in [
                "struct_type",
                "struct_member",
                "member_bounds",
                "subobject_alias",
                "type_layout",
                "layout_member",
            ] {
                let count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [table],
                        |r| r.get(0),
                    )
                    .unwrap();
                assert_eq!(count, 1, "table {table} should exist");
            }
            let views: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name = 'alias_bounds'",
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(views, 1);
        });
    }

    #[test]
    fn test_insert_struct_type_dedup() {
        let storage = Storage::open_in_memory().unwrap();
        storage.init_schema().unwrap();

        storage
            .transaction(|tx| {
                let (id, fresh) = insert_struct_type(tx, &test_row("foo")).unwrap();
                assert_eq!(id, 2);
                assert!(fresh);

                let mut dup = test_row("foo");
                dup.id = 7;
                let (id, fresh) = insert_struct_type(tx, &dup).unwrap();
                assert_eq!(id, 2, "conflict must hand back the stored id");
                assert!(!fresh);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("layouts.db");

        {
            let storage = Storage::open(&db_path).unwrap();
            storage.init_schema().unwrap();
            storage
                .transaction(|tx| insert_struct_type(tx, &test_row("persisted")).map(|_| ()))
                .unwrap();
        }

        let storage = Storage::open(&db_path).unwrap();
        storage.init_schema().unwrap();
        storage.with_connection(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM struct_type WHERE name = 'persisted'",
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1);
        });
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let storage = Storage::open_in_memory().unwrap();
        storage.init_schema().unwrap();

        let result: Result<(), ScrapeError> = storage.transaction(|tx| {
            insert_struct_type(tx, &test_row("doomed"))?;
            Err(ScrapeError::BoundsOverflow { offset: 0, length: 0 })
        });
        assert!(result.is_err());

        storage.with_connection(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM struct_type", [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "rolled-back insert must not be visible");
        });
    }
}
