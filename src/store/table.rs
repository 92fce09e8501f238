// Chunked column table
// Bridges one schema column to its on-disk extensible array

use rusqlite::Connection;

use super::codec::{decode_chunk, encode_chunk};
use super::container;
use super::error::{StoreError, StoreResult};
use super::row::{ColumnData, Row};
use crate::schema::{ColumnRole, ColumnSpec};

pub struct ColumnTable {
    spec: ColumnSpec,
    chunk_size: usize,

    /// Exactly one chunk of values, reused across flushes
    staging: ColumnData,

    /// Encoded form of `staging`, reused across flushes
    blob: Vec<u8>,
}

impl ColumnTable {
    pub fn new(spec: ColumnSpec, chunk_size: usize) -> Self {
        let staging = ColumnData::with_capacity(spec.kind, chunk_size * spec.width);
        ColumnTable {
            spec,
            chunk_size,
            staging,
            blob: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.spec.width
    }

    /// Rows currently stored on disk
    pub fn extent(&self, conn: &Connection) -> StoreResult<usize> {
        Ok(container::chunk_count(conn, &self.spec.name)? * self.chunk_size)
    }

    /// Fill the staging buffer with this column's values from exactly one
    /// chunk of rows
    pub fn stage(&mut self, rows: &[Row]) -> StoreResult<()> {
        debug_assert_eq!(rows.len(), self.chunk_size);

        self.staging.clear();
        match &mut self.staging {
            ColumnData::Double(buffer) => {
                for row in rows {
                    buffer.extend_from_slice(row.doubles_for(&self.spec)?);
                }
            }
            ColumnData::Int(buffer) => {
                for row in rows {
                    buffer.extend_from_slice(row.ints_for(&self.spec)?);
                }
            }
            ColumnData::Str(buffer) => {
                if self.spec.role != ColumnRole::FileName {
                    return Err(StoreError::MissingRowData(self.spec.name.clone()));
                }
                buffer.extend(rows.iter().map(|row| row.file_name.clone()));
            }
        }
        Ok(())
    }

    /// Extend the on-disk array by one chunk and write the staging buffer
    /// into it. `at_row` must equal the current extent.
    pub fn flush(&mut self, conn: &Connection, at_row: usize) -> StoreResult<()> {
        if at_row % self.chunk_size != 0 {
            return Err(StoreError::Corrupt(format!(
                "flush of column '{}' at unaligned row {}",
                self.spec.name, at_row
            )));
        }
        let extent = self.extent(conn)?;
        if extent != at_row {
            return Err(StoreError::Corrupt(format!(
                "column '{}' has {} rows, expected {}",
                self.spec.name, extent, at_row
            )));
        }
        if self.staging.len() != self.chunk_size * self.spec.width {
            return Err(StoreError::Corrupt(format!(
                "column '{}' staged {} values for a {}-row chunk",
                self.spec.name,
                self.staging.len(),
                self.chunk_size
            )));
        }

        encode_chunk(&self.staging, &mut self.blob)?;
        container::insert_chunk(conn, &self.spec.name, at_row / self.chunk_size, &self.blob)
    }

    /// Read `count` contiguous rows starting at `start`
    pub fn read_slice(&self, conn: &Connection, start: usize, count: usize) -> StoreResult<ColumnData> {
        let width = self.spec.width;
        let mut out = ColumnData::with_capacity(self.spec.kind, count * width);
        if count == 0 {
            return Ok(out);
        }

        let end = start + count;
        for chunk_index in start / self.chunk_size..=(end - 1) / self.chunk_size {
            let chunk = self.read_chunk(conn, chunk_index)?;
            let chunk_start = chunk_index * self.chunk_size;
            let from = start.max(chunk_start);
            let to = end.min(chunk_start + self.chunk_size);
            out.extend_rows(&chunk, width, from - chunk_start, to - from)?;
        }
        Ok(out)
    }

    /// Overwrite `count` rows starting at `start` with rows of `data`
    /// beginning at row `data_row`, read-modify-writing each affected chunk
    pub fn write_slice(
        &mut self,
        conn: &Connection,
        start: usize,
        data: &ColumnData,
        data_row: usize,
        count: usize,
    ) -> StoreResult<()> {
        if count == 0 {
            return Ok(());
        }
        let width = self.spec.width;

        let end = start + count;
        for chunk_index in start / self.chunk_size..=(end - 1) / self.chunk_size {
            let mut chunk = self.read_chunk(conn, chunk_index)?;
            let chunk_start = chunk_index * self.chunk_size;
            let from = start.max(chunk_start);
            let to = end.min(chunk_start + self.chunk_size);
            chunk.overwrite_rows(width, from - chunk_start, data, data_row + (from - start), to - from)?;

            encode_chunk(&chunk, &mut self.blob)?;
            container::update_chunk(conn, &self.spec.name, chunk_index, &self.blob)?;
        }
        Ok(())
    }

    /// Exchange two absolute rows on disk
    pub fn swap_rows(&mut self, conn: &Connection, i: usize, j: usize) -> StoreResult<()> {
        if i == j {
            return Ok(());
        }
        let row_i = self.read_slice(conn, i, 1)?;
        let row_j = self.read_slice(conn, j, 1)?;
        self.write_slice(conn, i, &row_j, 0, 1)?;
        self.write_slice(conn, j, &row_i, 0, 1)
    }

    fn read_chunk(&self, conn: &Connection, chunk_index: usize) -> StoreResult<ColumnData> {
        let blob = container::read_chunk(conn, &self.spec.name, chunk_index)?;
        decode_chunk(self.spec.kind, &blob, self.chunk_size * self.spec.width)
    }
}
