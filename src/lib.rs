// Featurestore - Chunked on-disk store for labeled training examples
// Module declarations

pub mod pipeline;
pub mod schema;
pub mod store;

pub use pipeline::{compile_stores, CompileJob, CompileOptions, JobOutcome, JobStatus, RowSource};
pub use schema::{ColumnKind, ColumnRole, ColumnSpec, FeatureConfiguration, Schema, SchemaError};
pub use store::{
    CreateMode, FeatureStore, Label, Row, ShuffleOptions, ShuffleReport, StoreError, StoreOptions,
    StoreResult,
};
