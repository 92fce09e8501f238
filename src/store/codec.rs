// Chunk blob encoding
// Numeric chunks are packed little-endian; string chunks are JSON arrays

use sha2::{Digest, Sha256};

use super::error::{StoreError, StoreResult};
use super::row::ColumnData;
use crate::schema::ColumnKind;

/// Encode `data` into `out`, replacing its previous contents
pub fn encode_chunk(data: &ColumnData, out: &mut Vec<u8>) -> StoreResult<()> {
    out.clear();
    match data {
        ColumnData::Double(values) => {
            out.reserve(values.len() * 8);
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        ColumnData::Int(values) => {
            out.reserve(values.len() * 8);
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        ColumnData::Str(values) => serde_json::to_writer(&mut *out, values)?,
    }
    Ok(())
}

/// Decode a chunk that must hold exactly `elements` values of `kind`
pub fn decode_chunk(kind: ColumnKind, bytes: &[u8], elements: usize) -> StoreResult<ColumnData> {
    let data = match kind {
        ColumnKind::Double => {
            check_numeric_len(bytes, elements)?;
            ColumnData::Double(
                bytes
                    .chunks_exact(8)
                    .map(|b| f64::from_le_bytes(to_array(b)))
                    .collect(),
            )
        }
        ColumnKind::Int => {
            check_numeric_len(bytes, elements)?;
            ColumnData::Int(
                bytes
                    .chunks_exact(8)
                    .map(|b| i64::from_le_bytes(to_array(b)))
                    .collect(),
            )
        }
        ColumnKind::String => {
            let values: Vec<String> = serde_json::from_slice(bytes)
                .map_err(|e| StoreError::Corrupt(format!("undecodable string chunk: {}", e)))?;
            if values.len() != elements {
                return Err(StoreError::Corrupt(format!(
                    "string chunk holds {} values, expected {}",
                    values.len(),
                    elements
                )));
            }
            ColumnData::Str(values)
        }
    };
    Ok(data)
}

/// Hex SHA-256 of a chunk blob
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn check_numeric_len(bytes: &[u8], elements: usize) -> StoreResult<()> {
    if bytes.len() != elements * 8 {
        return Err(StoreError::Corrupt(format!(
            "numeric chunk is {} bytes, expected {}",
            bytes.len(),
            elements * 8
        )));
    }
    Ok(())
}

fn to_array(bytes: &[u8]) -> [u8; 8] {
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    array
}
