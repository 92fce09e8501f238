// SQLite backing container and migrations
// Each column is an extensible array stored as one blob per chunk
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;

use super::codec;
use super::error::{StoreError, StoreResult};
use crate::schema::{ColumnKind, ColumnRole, ColumnSpec};

pub const META_STORE_ID: &str = "store_id";
pub const META_CHUNK_SIZE: &str = "chunk_size";
pub const META_CREATED_AT: &str = "created_at";

/// How `create` treats an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// Fail if the file already exists
    #[default]
    Exclusive,
    /// Replace any existing file
    Truncate,
}

/// Column declaration as persisted; roles are not stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub width: usize,
}

impl StoredColumn {
    /// Schema-side view of the persisted declaration under `role`
    pub fn as_spec(&self, role: ColumnRole) -> ColumnSpec {
        ColumnSpec {
            name: self.name.clone(),
            kind: self.kind,
            width: self.width,
            role,
        }
    }
}

/// Create a fresh container file
pub fn create_container(path: &Path, mode: CreateMode) -> StoreResult<Connection> {
    if path.exists() {
        match mode {
            CreateMode::Exclusive => return Err(StoreError::AlreadyExists(path.to_path_buf())),
            CreateMode::Truncate => remove_container_files(path)?,
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    configure(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an existing container file
pub fn open_container(path: &Path) -> StoreResult<Connection> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    // Leave files that were never initialized as a store untouched
    for table in ["schema_migrations", "store_meta"] {
        if !has_table(&conn, table)? {
            return Err(StoreError::Corrupt(format!(
                "{} is not a feature store (no '{}' table)",
                path.display(),
                table
            )));
        }
    }
    configure(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn has_table(conn: &Connection, name: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Delete a container file together with its WAL sidecars
pub(crate) fn remove_container_files(path: &Path) -> StoreResult<()> {
    std::fs::remove_file(path)?;
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn configure(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migration_v1(conn)?;
        conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [1])?;
    }

    Ok(())
}

fn migration_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS column_tables (
            position INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            width INTEGER NOT NULL
        )",
        [],
    )?;

    // One row per (column, chunk); a column's extent is its chunk count
    conn.execute(
        "CREATE TABLE IF NOT EXISTS chunks (
            column_name TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            data BLOB NOT NULL,
            sha256 TEXT NOT NULL,
            PRIMARY KEY (column_name, chunk_index),
            FOREIGN KEY (column_name) REFERENCES column_tables(name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS file_list (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    Ok(())
}

// ==================== METADATA ====================

pub fn write_meta(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn read_meta(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

// ==================== COLUMN DECLARATIONS ====================

pub fn write_columns(conn: &Connection, columns: &[ColumnSpec]) -> StoreResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO column_tables (position, name, kind, width) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (position, column) in columns.iter().enumerate() {
        stmt.execute(params![
            position as i64,
            column.name,
            column.kind.as_str(),
            column.width as i64,
        ])?;
    }
    Ok(())
}

pub fn read_columns(conn: &Connection) -> StoreResult<Vec<StoredColumn>> {
    let mut stmt =
        conn.prepare("SELECT name, kind, width FROM column_tables ORDER BY position")?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(name, kind, width)| {
            let kind = ColumnKind::from_string(&kind).ok_or_else(|| {
                StoreError::Corrupt(format!("column '{}' has unknown kind '{}'", name, kind))
            })?;
            Ok(StoredColumn {
                name,
                kind,
                width: width as usize,
            })
        })
        .collect()
}

// ==================== CHUNKS ====================

/// Number of chunks stored for a column. Chunk indices must be contiguous
/// from zero.
pub fn chunk_count(conn: &Connection, column: &str) -> StoreResult<usize> {
    let (count, max_index): (i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), MAX(chunk_index) FROM chunks WHERE column_name = ?1",
        [column],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if max_index.map_or(0, |max| max + 1) != count {
        return Err(StoreError::Corrupt(format!(
            "column '{}' has gaps in its chunk sequence",
            column
        )));
    }
    Ok(count as usize)
}

pub fn insert_chunk(conn: &Connection, column: &str, index: usize, blob: &[u8]) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO chunks (column_name, chunk_index, data, sha256) VALUES (?1, ?2, ?3, ?4)",
        params![column, index as i64, blob, codec::checksum(blob)],
    )?;
    Ok(())
}

pub fn update_chunk(conn: &Connection, column: &str, index: usize, blob: &[u8]) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE chunks SET data = ?3, sha256 = ?4 WHERE column_name = ?1 AND chunk_index = ?2",
        params![column, index as i64, blob, codec::checksum(blob)],
    )?;
    if updated != 1 {
        return Err(StoreError::Corrupt(format!(
            "column '{}' has no chunk {}",
            column, index
        )));
    }
    Ok(())
}

/// Read one chunk blob and verify its checksum
pub fn read_chunk(conn: &Connection, column: &str, index: usize) -> StoreResult<Vec<u8>> {
    let mut stmt = conn.prepare_cached(
        "SELECT data, sha256 FROM chunks WHERE column_name = ?1 AND chunk_index = ?2",
    )?;
    let (blob, sha256): (Vec<u8>, String) = stmt
        .query_row(params![column, index as i64], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?
        .ok_or_else(|| {
            StoreError::Corrupt(format!("column '{}' has no chunk {}", column, index))
        })?;

    if codec::checksum(&blob) != sha256 {
        return Err(StoreError::Corrupt(format!(
            "checksum mismatch in column '{}' chunk {}",
            column, index
        )));
    }
    Ok(blob)
}

// ==================== FILE LIST ====================

/// All known file identifiers in insertion order
pub fn read_file_list(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM file_list ORDER BY id")?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(paths)
}

pub fn append_file_list(conn: &Connection, paths: &[String]) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached("INSERT INTO file_list (path) VALUES (?1)")?;
    for path in paths {
        stmt.execute([path])?;
    }
    Ok(())
}

/// Flush the write-ahead log into the main database file
pub fn checkpoint(conn: &Connection) -> StoreResult<()> {
    conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use tempfile::TempDir;

    #[test]
    fn test_migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let table_count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('store_meta', 'column_tables', 'chunks', 'file_list')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_count, 4);

        let versions: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_exclusive_create_fails_on_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        drop(create_container(&path, CreateMode::Exclusive).unwrap());

        let result = create_container(&path, CreateMode::Exclusive);
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));

        assert!(create_container(&path, CreateMode::Truncate).is_ok());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = open_container(&dir.path().join("missing.db"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_open_leaves_foreign_database_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foreign.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE notes (body TEXT)", []).unwrap();
        }

        assert!(matches!(open_container(&path), Err(StoreError::Corrupt(_))));

        let conn = Connection::open(&path).unwrap();
        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal, "delete");
        assert!(!has_table(&conn, "schema_migrations").unwrap());
        assert!(!has_table(&conn, "store_meta").unwrap());
    }

    #[test]
    fn test_remove_container_files_clears_sidecars() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let conn = create_container(&path, CreateMode::Exclusive).unwrap();
        write_meta(&conn, META_CHUNK_SIZE, "4").unwrap();
        drop(conn);

        remove_container_files(&path).unwrap();
        assert!(!path.exists());
        assert!(!dir.path().join("store.db-wal").exists());
        assert!(!dir.path().join("store.db-shm").exists());
    }

    #[test]
    fn test_columns_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let schema = Schema::with_features(&[("spectrum", 12)]).unwrap();
        write_columns(&conn, schema.columns()).unwrap();

        let stored = read_columns(&conn).unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[3].name, "spectrum");
        assert_eq!(stored[3].kind, ColumnKind::Double);
        assert_eq!(stored[3].width, 12);
    }

    #[test]
    fn test_chunk_checksum_detects_tampering() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let schema = Schema::with_features(&[]).unwrap();
        write_columns(&conn, schema.columns()).unwrap();

        insert_chunk(&conn, "offset", 0, &[1, 2, 3]).unwrap();
        assert_eq!(read_chunk(&conn, "offset", 0).unwrap(), vec![1, 2, 3]);
        assert_eq!(chunk_count(&conn, "offset").unwrap(), 1);

        conn.execute("UPDATE chunks SET data = x'010204'", []).unwrap();
        assert!(matches!(read_chunk(&conn, "offset", 0), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_meta_upsert() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert_eq!(read_meta(&conn, META_CHUNK_SIZE).unwrap(), None);
        write_meta(&conn, META_CHUNK_SIZE, "4").unwrap();
        write_meta(&conn, META_CHUNK_SIZE, "8").unwrap();
        assert_eq!(read_meta(&conn, META_CHUNK_SIZE).unwrap().as_deref(), Some("8"));
    }

    #[test]
    fn test_file_list_keeps_insertion_order() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        append_file_list(&conn, &["b.wav".to_string(), "a.wav".to_string()]).unwrap();
        append_file_list(&conn, &["c.wav".to_string()]).unwrap();
        assert_eq!(read_file_list(&conn).unwrap(), vec!["b.wav", "a.wav", "c.wav"]);
    }
}
