// Pipeline module
// Drives feature store builds and records their progress

pub mod compile;
pub mod trace;

pub use compile::{
    compile_stores, store_path_for, CompileJob, CompileOptions, JobOutcome, JobStatus,
    MemorySource, PipelineError, RowSource,
};
pub use trace::{read_trace_file, TraceEntry, TraceError, TraceStage, TraceWriter};
