// Feature store
// Buffered, chunk-aligned append path over one column table per schema column

use chrono::Utc;
use rusqlite::Connection;
use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::container::{self, CreateMode};
use super::error::{StoreError, StoreResult};
use super::row::{ColumnData, Label, Row};
use super::table::ColumnTable;
use crate::schema::{ColumnRole, Schema};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Rows per durable chunk
    pub chunk_size: usize,

    /// Behaviour of `create` when the file exists
    pub create_mode: CreateMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            create_mode: CreateMode::Exclusive,
        }
    }
}

/// Append-only store of labeled feature rows.
///
/// Rows are buffered until a full chunk is available; only whole chunks
/// reach disk, and readers only see those. A store that returns a
/// non-configuration error is poisoned and refuses further use.
pub struct FeatureStore {
    path: PathBuf,
    pub(super) conn: Connection,
    schema: Schema,
    chunk_size: usize,
    store_id: Uuid,
    pub(super) tables: Vec<ColumnTable>,

    file_list: Vec<String>,
    known_files: HashSet<String>,

    pub(super) example_count: usize,
    pending: Vec<Row>,
    poisoned: Cell<bool>,
}

impl FeatureStore {
    /// Create a new, empty store at `path`
    pub fn create(path: impl AsRef<Path>, schema: Schema, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        check_chunk_size(options.chunk_size)?;

        let mut conn = container::create_container(path, options.create_mode)?;
        let store_id = Uuid::new_v4();

        let tx = conn.transaction()?;
        container::write_meta(&tx, container::META_STORE_ID, &store_id.to_string())?;
        container::write_meta(&tx, container::META_CHUNK_SIZE, &options.chunk_size.to_string())?;
        container::write_meta(&tx, container::META_CREATED_AT, &Utc::now().to_rfc3339())?;
        container::write_columns(&tx, schema.columns())?;
        tx.commit()?;

        log::info!(
            "Created feature store {} at {} ({} columns, chunk size {})",
            store_id,
            path.display(),
            schema.len(),
            options.chunk_size
        );

        Ok(Self::bind(path, conn, schema, options.chunk_size, store_id, 0, Vec::new()))
    }

    /// Open an existing store, validating its columns against `schema`
    pub fn open(path: impl AsRef<Path>, schema: Schema, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        check_chunk_size(options.chunk_size)?;

        let conn = container::open_container(path)?;

        let chunk_size = container::read_meta(&conn, container::META_CHUNK_SIZE)?
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| StoreError::Corrupt("missing chunk size".to_string()))?;
        if chunk_size != options.chunk_size {
            return Err(StoreError::ChunkSizeMismatch {
                expected: options.chunk_size,
                found: chunk_size,
            });
        }

        let store_id = container::read_meta(&conn, container::META_STORE_ID)?
            .and_then(|v| Uuid::parse_str(&v).ok())
            .ok_or_else(|| StoreError::Corrupt("missing store id".to_string()))?;

        validate_columns(&conn, &schema)?;

        let mut example_count = None;
        for column in schema.columns() {
            let extent = container::chunk_count(&conn, &column.name)? * chunk_size;
            match example_count {
                None => example_count = Some(extent),
                Some(count) if count != extent => {
                    return Err(StoreError::Corrupt(format!(
                        "column '{}' has {} rows, other columns have {}",
                        column.name, extent, count
                    )));
                }
                Some(_) => {}
            }
        }
        let example_count = example_count.unwrap_or(0);
        let file_list = container::read_file_list(&conn)?;

        log::info!(
            "Opened feature store {} at {} ({} examples, {} files)",
            store_id,
            path.display(),
            example_count,
            file_list.len()
        );

        Ok(Self::bind(path, conn, schema, chunk_size, store_id, example_count, file_list))
    }

    /// Open the store at `path` if it exists, otherwise create it
    pub fn open_or_create(path: impl AsRef<Path>, schema: Schema, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, schema, options)
        } else {
            Self::create(path, schema, options)
        }
    }

    fn bind(
        path: &Path,
        conn: Connection,
        schema: Schema,
        chunk_size: usize,
        store_id: Uuid,
        example_count: usize,
        file_list: Vec<String>,
    ) -> Self {
        let tables = schema
            .columns()
            .iter()
            .map(|spec| ColumnTable::new(spec.clone(), chunk_size))
            .collect();
        let known_files = file_list.iter().cloned().collect();

        FeatureStore {
            path: path.to_path_buf(),
            conn,
            schema,
            chunk_size,
            store_id,
            tables,
            file_list,
            known_files,
            example_count,
            pending: Vec::with_capacity(chunk_size),
            poisoned: Cell::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Rows durably stored and visible to readers
    pub fn example_count(&self) -> usize {
        self.example_count
    }

    /// Rows buffered in memory, always fewer than one chunk
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Distinct file identifiers in first-seen order
    pub fn file_list(&self) -> &[String] {
        &self.file_list
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    // ==================== WRITE PATH ====================

    /// Buffer one row, flushing a chunk once enough rows are pending
    pub fn append_row(&mut self, row: Row) -> StoreResult<()> {
        self.check_usable()?;
        let result = self.push_row(row);
        self.guard(result)
    }

    /// Buffer many rows, flushing as many full chunks as become available
    pub fn append_rows(&mut self, rows: impl IntoIterator<Item = Row>) -> StoreResult<()> {
        self.check_usable()?;
        for row in rows {
            let result = self.push_row(row);
            self.guard(result)?;
        }
        Ok(())
    }

    fn push_row(&mut self, row: Row) -> StoreResult<()> {
        for column in self.schema.columns() {
            row.validate_column(column)?;
        }

        self.pending.push(row);
        if self.pending.len() == self.chunk_size {
            self.write_pending_chunk()?;
        }
        Ok(())
    }

    /// Write the pending chunk to every column in one transaction
    fn write_pending_chunk(&mut self) -> StoreResult<()> {
        let at_row = self.example_count;

        let mut new_files = Vec::new();
        for row in &self.pending {
            if !self.known_files.contains(&row.file_name) && !new_files.contains(&row.file_name) {
                new_files.push(row.file_name.clone());
            }
        }

        let tx = self.conn.transaction()?;
        for table in &mut self.tables {
            table.stage(&self.pending)?;
            table.flush(&tx, at_row)?;
        }
        if !new_files.is_empty() {
            container::append_file_list(&tx, &new_files)?;
        }
        tx.commit()?;

        self.known_files.extend(new_files.iter().cloned());
        self.file_list.extend(new_files);
        self.example_count += self.chunk_size;
        self.pending.clear();

        log::debug!(
            "Flushed chunk {} of {} ({} examples)",
            at_row / self.chunk_size,
            self.path.display(),
            self.example_count
        );
        Ok(())
    }

    /// Sync completed chunks to stable storage. Pending rows stay buffered.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.check_usable()?;
        let result = container::checkpoint(&self.conn);
        self.guard(result)
    }

    /// Remove and return the buffered rows that do not fill a chunk
    pub fn take_pending(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.pending)
    }

    /// Sync and close the store. Rows still pending are not written; they
    /// are returned so the caller decides what to do with them.
    pub fn close(mut self) -> StoreResult<Vec<Row>> {
        let pending = self.sync_and_take_pending()?;
        log::info!(
            "Closed feature store {} ({} examples, {} rows not written)",
            self.path.display(),
            self.example_count,
            pending.len()
        );
        Ok(pending)
    }

    /// Pending rows stay buffered if the sync fails, so dropping the store
    /// still reports them
    fn sync_and_take_pending(&mut self) -> StoreResult<Vec<Row>> {
        if !self.is_poisoned() {
            let result = container::checkpoint(&self.conn);
            self.guard(result)?;
        }
        Ok(self.take_pending())
    }

    // ==================== READ PATH ====================

    /// Read `count` durable rows starting at `start`
    pub fn read_rows(&self, start: usize, count: usize) -> StoreResult<Vec<Row>> {
        self.check_usable()?;
        self.check_range(start, count)?;

        let mut slices = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let result = table.read_slice(&self.conn, start, count);
            slices.push(self.guard(result)?);
        }

        let mut rows = Vec::with_capacity(count);
        for r in 0..count {
            rows.push(self.assemble_row(&slices, r)?);
        }
        Ok(rows)
    }

    /// Read one column over `count` durable rows starting at `start`
    pub fn read_column(&self, name: &str, start: usize, count: usize) -> StoreResult<ColumnData> {
        self.check_usable()?;
        let position = self
            .schema
            .position(name)
            .ok_or_else(|| StoreError::MissingColumn(name.to_string()))?;
        self.check_range(start, count)?;

        let result = self.tables[position].read_slice(&self.conn, start, count);
        self.guard(result)
    }

    /// Re-read the persisted file list
    pub fn read_file_list(&self) -> StoreResult<Vec<String>> {
        self.check_usable()?;
        let result = container::read_file_list(&self.conn);
        self.guard(result)
    }

    fn assemble_row(&self, slices: &[ColumnData], r: usize) -> StoreResult<Row> {
        let mut row = Row::new(Label::Class(0), 0, String::new());

        for (spec, slice) in self.schema.columns().iter().zip(slices) {
            let width = spec.width;
            let range = r * width..(r + 1) * width;
            match (spec.role, slice) {
                (ColumnRole::Label, ColumnData::Int(values)) => row.label = Label::Class(values[r]),
                (ColumnRole::Label, ColumnData::Double(values)) => {
                    row.label = Label::Vector(values[range].to_vec())
                }
                (ColumnRole::Offset, ColumnData::Int(values)) => row.offset = values[r],
                (ColumnRole::FileName, ColumnData::Str(values)) => row.file_name = values[r].clone(),
                (ColumnRole::Feature, ColumnData::Double(values)) => {
                    row.features.insert(spec.name.clone(), values[range].to_vec());
                }
                (ColumnRole::Feature, ColumnData::Int(values)) => {
                    row.int_features.insert(spec.name.clone(), values[range].to_vec());
                }
                _ => {
                    return Err(StoreError::Corrupt(format!(
                        "column '{}' holds {} data",
                        spec.name,
                        slice.kind()
                    )))
                }
            }
        }
        Ok(row)
    }

    // ==================== CONTRACT ====================

    pub(super) fn check_usable(&self) -> StoreResult<()> {
        if self.poisoned.get() {
            return Err(StoreError::Poisoned);
        }
        Ok(())
    }

    fn check_range(&self, start: usize, count: usize) -> StoreResult<()> {
        let end = start.checked_add(count);
        match end {
            Some(end) if end <= self.example_count => Ok(()),
            _ => self.guard(Err(StoreError::OutOfRange {
                start,
                end: end.unwrap_or(usize::MAX),
                example_count: self.example_count,
            })),
        }
    }

    /// Poison the store on any failure that is not a configuration error
    pub(super) fn guard<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(e) = &result {
            if !e.is_configuration() && !self.poisoned.get() {
                log::error!("Feature store {} failed: {}", self.path.display(), e);
                self.poisoned.set(true);
            }
        }
        result
    }
}

impl Drop for FeatureStore {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!(
                "Dropping {} buffered rows that do not fill a chunk in {}",
                self.pending.len(),
                self.path.display()
            );
        }
    }
}

fn check_chunk_size(chunk_size: usize) -> StoreResult<()> {
    if chunk_size == 0 {
        return Err(StoreError::InvalidChunkSize(chunk_size));
    }
    Ok(())
}

/// Compare on-disk column declarations with `schema` before reading any data
fn validate_columns(conn: &Connection, schema: &Schema) -> StoreResult<()> {
    let stored = container::read_columns(conn)?;

    for column in schema.columns() {
        let found = stored
            .iter()
            .find(|s| s.name == column.name)
            .ok_or_else(|| StoreError::MissingColumn(column.name.clone()))?;

        if !column.same_layout(&found.as_spec(column.role)) {
            return Err(StoreError::SchemaMismatch {
                column: column.name.clone(),
                expected_kind: column.kind,
                expected_width: column.width,
                found_kind: found.kind,
                found_width: found.width,
            });
        }
    }

    // Columns the schema does not know would fall behind on every append
    if let Some(extra) = stored.iter().find(|s| schema.column(&s.name).is_none()) {
        return Err(StoreError::UnexpectedColumn(extra.name.clone()));
    }

    Ok(())
}
