// Rows and column buffers
// A row is one labeled example; a ColumnData holds a run of rows for one column

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{StoreError, StoreResult};
use crate::schema::{ColumnKind, ColumnRole, ColumnSpec};

/// Example label: a single class or a vector of per-class activations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Label {
    Class(i64),
    Vector(Vec<f64>),
}

/// One labeled feature observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub label: Label,

    /// Frame offset of the example within its source file
    pub offset: i64,

    /// Identifier of the source file
    pub file_name: String,

    /// Double feature vectors keyed by column name
    pub features: BTreeMap<String, Vec<f64>>,

    /// Integer feature vectors keyed by column name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub int_features: BTreeMap<String, Vec<i64>>,
}

impl Row {
    pub fn new(label: Label, offset: i64, file_name: impl Into<String>) -> Self {
        Row {
            label,
            offset,
            file_name: file_name.into(),
            features: BTreeMap::new(),
            int_features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.features.insert(name.into(), values);
        self
    }

    pub fn with_int_feature(mut self, name: impl Into<String>, values: Vec<i64>) -> Self {
        self.int_features.insert(name.into(), values);
        self
    }

    /// This row's values for a double column
    pub(crate) fn doubles_for(&self, spec: &ColumnSpec) -> StoreResult<&[f64]> {
        let values: &[f64] = match (spec.role, &self.label) {
            (ColumnRole::Label, Label::Vector(values)) => values,
            (ColumnRole::Feature, _) => self
                .features
                .get(&spec.name)
                .ok_or_else(|| StoreError::MissingRowData(spec.name.clone()))?,
            _ => return Err(StoreError::MissingRowData(spec.name.clone())),
        };
        check_width(spec, values.len())?;
        Ok(values)
    }

    /// This row's values for an int column
    pub(crate) fn ints_for(&self, spec: &ColumnSpec) -> StoreResult<&[i64]> {
        let values: &[i64] = match (spec.role, &self.label) {
            (ColumnRole::Label, Label::Class(class)) => std::slice::from_ref(class),
            (ColumnRole::Offset, _) => std::slice::from_ref(&self.offset),
            (ColumnRole::Feature, _) => self
                .int_features
                .get(&spec.name)
                .ok_or_else(|| StoreError::MissingRowData(spec.name.clone()))?,
            _ => return Err(StoreError::MissingRowData(spec.name.clone())),
        };
        check_width(spec, values.len())?;
        Ok(values)
    }

    /// Check that the row supplies a correctly sized value for `spec`
    pub(crate) fn validate_column(&self, spec: &ColumnSpec) -> StoreResult<()> {
        match spec.kind {
            ColumnKind::Double => self.doubles_for(spec).map(|_| ()),
            ColumnKind::Int => self.ints_for(spec).map(|_| ()),
            ColumnKind::String => match spec.role {
                ColumnRole::FileName => Ok(()),
                _ => Err(StoreError::MissingRowData(spec.name.clone())),
            },
        }
    }
}

fn check_width(spec: &ColumnSpec, found: usize) -> StoreResult<()> {
    if found != spec.width {
        return Err(StoreError::WidthMismatch {
            column: spec.name.clone(),
            expected: spec.width,
            found,
        });
    }
    Ok(())
}

/// Row-major values of one column over a run of rows.
/// A row occupies `width` consecutive elements; string columns have width 1.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Double(Vec<f64>),
    Int(Vec<i64>),
    Str(Vec<String>),
}

impl ColumnData {
    pub fn with_capacity(kind: ColumnKind, elements: usize) -> Self {
        match kind {
            ColumnKind::Double => ColumnData::Double(Vec::with_capacity(elements)),
            ColumnKind::Int => ColumnData::Int(Vec::with_capacity(elements)),
            ColumnKind::String => ColumnData::Str(Vec::with_capacity(elements)),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnData::Double(_) => ColumnKind::Double,
            ColumnData::Int(_) => ColumnKind::Int,
            ColumnData::Str(_) => ColumnKind::String,
        }
    }

    /// Number of elements (not rows)
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Double(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row_count(&self, width: usize) -> usize {
        self.len() / width
    }

    /// Empties the buffer, keeping its allocation
    pub fn clear(&mut self) {
        match self {
            ColumnData::Double(v) => v.clear(),
            ColumnData::Int(v) => v.clear(),
            ColumnData::Str(v) => v.clear(),
        }
    }

    /// Appends `count` rows of `other` starting at row `start`
    pub fn extend_rows(
        &mut self,
        other: &ColumnData,
        width: usize,
        start: usize,
        count: usize,
    ) -> StoreResult<()> {
        let range = start * width..(start + count) * width;
        match (self, other) {
            (ColumnData::Double(dst), ColumnData::Double(src)) => dst.extend_from_slice(&src[range]),
            (ColumnData::Int(dst), ColumnData::Int(src)) => dst.extend_from_slice(&src[range]),
            (ColumnData::Str(dst), ColumnData::Str(src)) => dst.extend_from_slice(&src[range]),
            (dst, src) => return Err(kinds_differ(dst, src)),
        }
        Ok(())
    }

    /// Overwrites `count` rows starting at row `dst_row` with rows of `src`
    /// starting at `src_row`
    pub fn overwrite_rows(
        &mut self,
        width: usize,
        dst_row: usize,
        src: &ColumnData,
        src_row: usize,
        count: usize,
    ) -> StoreResult<()> {
        let dst_range = dst_row * width..(dst_row + count) * width;
        let src_range = src_row * width..(src_row + count) * width;
        match (self, src) {
            (ColumnData::Double(dst), ColumnData::Double(src)) => {
                dst[dst_range].copy_from_slice(&src[src_range])
            }
            (ColumnData::Int(dst), ColumnData::Int(src)) => {
                dst[dst_range].copy_from_slice(&src[src_range])
            }
            (ColumnData::Str(dst), ColumnData::Str(src)) => {
                dst[dst_range].clone_from_slice(&src[src_range])
            }
            (dst, src) => return Err(kinds_differ(dst, src)),
        }
        Ok(())
    }

    /// Exchanges rows `i` and `j`
    pub fn swap_rows(&mut self, width: usize, i: usize, j: usize) {
        if i == j {
            return;
        }
        match self {
            ColumnData::Double(v) => swap_row_slices(v, width, i, j),
            ColumnData::Int(v) => swap_row_slices(v, width, i, j),
            ColumnData::Str(v) => swap_row_slices(v, width, i, j),
        }
    }

    pub fn doubles(&self) -> Option<&[f64]> {
        match self {
            ColumnData::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn ints(&self) -> Option<&[i64]> {
        match self {
            ColumnData::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn strings(&self) -> Option<&[String]> {
        match self {
            ColumnData::Str(v) => Some(v),
            _ => None,
        }
    }
}

fn kinds_differ(dst: &ColumnData, src: &ColumnData) -> StoreError {
    StoreError::Corrupt(format!("cannot copy {} rows into a {} column", src.kind(), dst.kind()))
}

fn swap_row_slices<T>(data: &mut [T], width: usize, i: usize, j: usize) {
    let (low, high) = if i < j { (i, j) } else { (j, i) };
    let (head, tail) = data.split_at_mut(high * width);
    head[low * width..(low + 1) * width].swap_with_slice(&mut tail[..width]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, kind: ColumnKind, width: usize, role: ColumnRole) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            kind,
            width,
            role,
        }
    }

    #[test]
    fn test_row_values_by_role() {
        let row = Row::new(Label::Class(3), 42, "a.wav").with_feature("spectrum", vec![1.0, 2.0]);

        let label = spec("label", ColumnKind::Int, 1, ColumnRole::Label);
        let offset = spec("offset", ColumnKind::Int, 1, ColumnRole::Offset);
        let spectrum = spec("spectrum", ColumnKind::Double, 2, ColumnRole::Feature);

        assert_eq!(row.ints_for(&label).unwrap(), &[3]);
        assert_eq!(row.ints_for(&offset).unwrap(), &[42]);
        assert_eq!(row.doubles_for(&spectrum).unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_missing_feature() {
        let row = Row::new(Label::Class(0), 0, "a.wav");
        let flux = spec("flux", ColumnKind::Double, 2, ColumnRole::Feature);
        assert!(matches!(
            row.validate_column(&flux),
            Err(StoreError::MissingRowData(name)) if name == "flux"
        ));
    }

    #[test]
    fn test_label_kind_mismatch() {
        let row = Row::new(Label::Class(1), 0, "a.wav");
        let label = spec("on_label", ColumnKind::Double, 4, ColumnRole::Label);
        assert!(matches!(row.validate_column(&label), Err(StoreError::MissingRowData(_))));
    }

    #[test]
    fn test_width_mismatch() {
        let row = Row::new(Label::Vector(vec![0.0; 3]), 0, "a.wav");
        let label = spec("on_label", ColumnKind::Double, 4, ColumnRole::Label);
        assert!(matches!(
            row.validate_column(&label),
            Err(StoreError::WidthMismatch { expected: 4, found: 3, .. })
        ));
    }

    #[test]
    fn test_swap_rows_is_width_aware() {
        let mut data = ColumnData::Double(vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1]);
        data.swap_rows(2, 2, 0);
        assert_eq!(data.doubles().unwrap(), &[2.0, 2.1, 1.0, 1.1, 0.0, 0.1]);

        data.swap_rows(2, 1, 1);
        assert_eq!(data.doubles().unwrap(), &[2.0, 2.1, 1.0, 1.1, 0.0, 0.1]);
    }

    #[test]
    fn test_swap_string_rows() {
        let mut data = ColumnData::Str(vec!["a".into(), "b".into(), "c".into()]);
        data.swap_rows(1, 0, 1);
        assert_eq!(data.strings().unwrap(), &["b", "a", "c"]);
    }

    #[test]
    fn test_extend_and_overwrite_rows() {
        let src = ColumnData::Int(vec![1, 2, 3, 4, 5, 6]);
        let mut dst = ColumnData::with_capacity(ColumnKind::Int, 4);
        dst.extend_rows(&src, 2, 1, 2).unwrap();
        assert_eq!(dst.ints().unwrap(), &[3, 4, 5, 6]);

        dst.overwrite_rows(2, 1, &src, 0, 1).unwrap();
        assert_eq!(dst.ints().unwrap(), &[3, 4, 1, 2]);

        let doubles = ColumnData::Double(vec![0.5, 1.5]);
        assert!(matches!(dst.extend_rows(&doubles, 2, 0, 1), Err(StoreError::Corrupt(_))));
        assert_eq!(dst.row_count(2), 2);
    }
}
