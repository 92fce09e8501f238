// Column declarations for a feature store
// Defines column kinds, roles, and the immutable schema consumed at create/open time

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const LABEL_COLUMN: &str = "label";
pub const OFFSET_COLUMN: &str = "offset";
pub const FILE_NAME_COLUMN: &str = "file_name";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("Column '{name}' is invalid: {reason}")]
    InvalidColumn { name: String, reason: String },

    #[error("Schema has no {0} column")]
    MissingRole(ColumnRole),

    #[error("Schema declares more than one {0} column")]
    DuplicateRole(ColumnRole),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Element type of a column table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Vector of `width` 64-bit floats per row
    Double,
    /// Vector of `width` 64-bit integers per row
    Int,
    /// One string per row (width is always 1)
    String,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Double => "double",
            ColumnKind::Int => "int",
            ColumnKind::String => "string",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "double" => Some(ColumnKind::Double),
            "int" => Some(ColumnKind::Int),
            "string" => Some(ColumnKind::String),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of a row a column carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Label,
    Offset,
    FileName,
    Feature,
}

impl std::fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnRole::Label => "label",
            ColumnRole::Offset => "offset",
            ColumnRole::FileName => "file name",
            ColumnRole::Feature => "feature",
        };
        f.write_str(name)
    }
}

/// A single named, fixed-width column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub width: usize,
    pub role: ColumnRole,
}

impl ColumnSpec {
    /// True when name, element type and width agree. The role is a
    /// schema-side notion and is not persisted.
    pub fn same_layout(&self, other: &ColumnSpec) -> bool {
        self.name == other.name && self.kind == other.kind && self.width == other.width
    }
}

/// Ordered, immutable set of column declarations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSpec>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Schema with an integer class label, the offset and file name columns,
    /// and one double column per `(name, width)` feature.
    pub fn with_features(features: &[(&str, usize)]) -> SchemaResult<Schema> {
        let mut builder = Schema::builder()
            .int_label(LABEL_COLUMN)
            .offset(OFFSET_COLUMN)
            .file_name(FILE_NAME_COLUMN);
        for (name, width) in features {
            builder = builder.double(*name, *width);
        }
        builder.build()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// The column holding `role`. Label, offset and file name are
    /// guaranteed present by the builder.
    pub fn column_for_role(&self, role: ColumnRole) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.role == role)
    }

    pub fn feature_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.role == ColumnRole::Feature)
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSpec>,
}

impl SchemaBuilder {
    fn push(mut self, name: impl Into<String>, kind: ColumnKind, width: usize, role: ColumnRole) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            kind,
            width,
            role,
        });
        self
    }

    /// Scalar class label stored as a width-1 integer column
    pub fn int_label(self, name: impl Into<String>) -> Self {
        self.push(name, ColumnKind::Int, 1, ColumnRole::Label)
    }

    /// Per-class label vector stored as a double column
    pub fn vector_label(self, name: impl Into<String>, width: usize) -> Self {
        self.push(name, ColumnKind::Double, width, ColumnRole::Label)
    }

    pub fn offset(self, name: impl Into<String>) -> Self {
        self.push(name, ColumnKind::Int, 1, ColumnRole::Offset)
    }

    pub fn file_name(self, name: impl Into<String>) -> Self {
        self.push(name, ColumnKind::String, 1, ColumnRole::FileName)
    }

    pub fn double(self, name: impl Into<String>, width: usize) -> Self {
        self.push(name, ColumnKind::Double, width, ColumnRole::Feature)
    }

    pub fn int(self, name: impl Into<String>, width: usize) -> Self {
        self.push(name, ColumnKind::Int, width, ColumnRole::Feature)
    }

    pub fn build(self) -> SchemaResult<Schema> {
        let mut index = HashMap::with_capacity(self.columns.len());
        let mut seen_roles = Vec::new();

        for (position, column) in self.columns.iter().enumerate() {
            if column.name.is_empty() {
                return Err(invalid(column, "name is empty"));
            }
            if column.width == 0 {
                return Err(invalid(column, "width must be at least 1"));
            }
            if index.insert(column.name.clone(), position).is_some() {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }

            match (column.role, column.kind) {
                (ColumnRole::Feature, ColumnKind::String) => {
                    return Err(invalid(column, "only the file name may be a string column"));
                }
                (ColumnRole::Label, ColumnKind::String) => {
                    return Err(invalid(column, "labels must be int or double"));
                }
                (ColumnRole::Label, ColumnKind::Int) | (ColumnRole::Offset, _)
                    if column.width != 1 =>
                {
                    return Err(invalid(column, "must have width 1"));
                }
                _ => {}
            }

            if column.role != ColumnRole::Feature {
                if seen_roles.contains(&column.role) {
                    return Err(SchemaError::DuplicateRole(column.role));
                }
                seen_roles.push(column.role);
            }
        }

        for role in [ColumnRole::Label, ColumnRole::Offset, ColumnRole::FileName] {
            if !seen_roles.contains(&role) {
                return Err(SchemaError::MissingRole(role));
            }
        }

        Ok(Schema {
            columns: self.columns,
            index,
        })
    }
}

fn invalid(column: &ColumnSpec, reason: &str) -> SchemaError {
    SchemaError::InvalidColumn {
        name: column.name.clone(),
        reason: reason.to_string(),
    }
}
