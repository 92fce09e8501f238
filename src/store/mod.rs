// Feature store module
// Chunked column tables over a SQLite container, the buffered write path,
// and the in-place shuffle

pub mod codec;
pub mod container;
pub mod database;
pub mod error;
pub mod row;
pub mod shuffle;
pub mod table;

pub use container::CreateMode;
pub use database::{FeatureStore, StoreOptions, DEFAULT_CHUNK_SIZE};
pub use error::{StoreError, StoreResult};
pub use row::{ColumnData, Label, Row};
pub use shuffle::{ShuffleOptions, ShuffleReport};
pub use table::ColumnTable;
