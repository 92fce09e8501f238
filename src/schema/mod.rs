// Schema registry
// Column declarations and the configuration that sizes them

pub mod config;
pub mod types;

pub use config::{ConfigError, FeatureConfiguration, NoteRange};
pub use types::{
    ColumnKind, ColumnRole, ColumnSpec, Schema, SchemaBuilder, SchemaError, FILE_NAME_COLUMN,
    LABEL_COLUMN, OFFSET_COLUMN,
};
