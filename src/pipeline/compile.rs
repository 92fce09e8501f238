// Store compilation driver
// Builds one feature store per input concurrently, isolating failures per store

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::trace::{TraceEntry, TraceStage, TraceWriter};
use crate::schema::Schema;
use crate::store::container;
use crate::store::{
    CreateMode, FeatureStore, Row, ShuffleOptions, StoreError, StoreOptions, DEFAULT_CHUNK_SIZE,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Producer of rows for one output store
pub trait RowSource: Send {
    /// Next batch of rows, or `None` once the input is exhausted
    fn next_batch(&mut self) -> PipelineResult<Option<Vec<Row>>>;
}

/// Rows already in memory, handed out in fixed-size batches
pub struct MemorySource {
    batches: VecDeque<Vec<Row>>,
}

impl MemorySource {
    pub fn new(rows: Vec<Row>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let mut batches = VecDeque::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            batches.push_back(rows.by_ref().take(batch_size).collect());
        }
        MemorySource { batches }
    }
}

impl RowSource for MemorySource {
    fn next_batch(&mut self) -> PipelineResult<Option<Vec<Row>>> {
        Ok(self.batches.pop_front())
    }
}

pub struct CompileJob {
    pub output: PathBuf,
    pub source: Box<dyn RowSource>,
}

impl CompileJob {
    pub fn new(output: impl Into<PathBuf>, source: impl RowSource + 'static) -> Self {
        CompileJob {
            output: output.into(),
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub schema: Schema,
    pub chunk_size: usize,

    /// Rebuild outputs that already exist instead of skipping them
    pub overwrite: bool,

    /// Shuffle each store after its input is exhausted
    pub shuffle: Option<ShuffleOptions>,

    /// JSONL file receiving per-store progress entries
    pub trace_path: Option<PathBuf>,
}

impl CompileOptions {
    pub fn new(schema: Schema) -> Self {
        CompileOptions {
            schema,
            chunk_size: DEFAULT_CHUNK_SIZE,
            overwrite: false,
            shuffle: None,
            trace_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Output existed and `overwrite` was off
    Skipped,
    Completed {
        examples: usize,
        /// Trailing rows that did not fill a chunk
        unwritten: usize,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub output: PathBuf,
    pub status: JobStatus,
}

/// Build every job's store on the blocking pool. Store creation and closing
/// are serialized through one lock; everything in between runs in parallel.
/// Outcomes are returned in job order.
pub async fn compile_stores(jobs: Vec<CompileJob>, options: CompileOptions) -> Vec<JobOutcome> {
    let total = jobs.len();
    let options = Arc::new(options);
    let lifecycle = Arc::new(Mutex::new(()));
    let trace = options
        .trace_path
        .clone()
        .map(|path| Arc::new(TraceWriter::new(path)));

    log::info!("Compiling {} feature stores", total);

    let mut handles = Vec::with_capacity(total);
    for job in jobs {
        let output = job.output.clone();
        let options = Arc::clone(&options);
        let lifecycle = Arc::clone(&lifecycle);
        let trace = trace.clone();

        let handle = tokio::task::spawn_blocking(move || {
            run_job(job, &options, &lifecycle, trace.as_deref())
        });
        handles.push((output, handle));
    }

    let mut outcomes = Vec::with_capacity(total);
    for (index, (output, handle)) in handles.into_iter().enumerate() {
        let status = match handle.await {
            Ok(status) => status,
            Err(e) => {
                log::error!("Compile worker for {} panicked: {}", output.display(), e);
                JobStatus::Failed(format!("worker panicked: {}", e))
            }
        };
        log::info!("Store {} of {}: {} {:?}", index + 1, total, output.display(), status);
        outcomes.push(JobOutcome { output, status });
    }
    outcomes
}

fn run_job(
    job: CompileJob,
    options: &CompileOptions,
    lifecycle: &Mutex<()>,
    trace: Option<&TraceWriter>,
) -> JobStatus {
    let output = job.output.clone();
    match compile_one(job, options, lifecycle, trace) {
        Ok(status) => status,
        Err(e) => {
            log::error!("Failed to compile {}: {}", output.display(), e);
            record(trace, TraceEntry::new(&output, TraceStage::Failed, 1.0, e.to_string()));
            JobStatus::Failed(e.to_string())
        }
    }
}

fn compile_one(
    mut job: CompileJob,
    options: &CompileOptions,
    lifecycle: &Mutex<()>,
    trace: Option<&TraceWriter>,
) -> PipelineResult<JobStatus> {
    let output = job.output.as_path();

    if !options.overwrite && output.exists() {
        log::debug!("Skipping existing store {}", output.display());
        record(trace, TraceEntry::new(output, TraceStage::Skipped, 1.0, "Output exists"));
        return Ok(JobStatus::Skipped);
    }

    let store_options = StoreOptions {
        chunk_size: options.chunk_size,
        create_mode: if options.overwrite {
            CreateMode::Truncate
        } else {
            CreateMode::Exclusive
        },
    };
    let mut store = {
        let _guard = lock(lifecycle);
        FeatureStore::create(output, options.schema.clone(), store_options)?
    };
    record(trace, TraceEntry::new(output, TraceStage::Start, 0.0, "Created store"));

    let filled = fill_store(&mut store, job.source.as_mut(), options, output, trace);
    let examples = store.example_count();
    let closed = match filled {
        Ok(()) => {
            let _guard = lock(lifecycle);
            store.close().map_err(PipelineError::from)
        }
        Err(e) => {
            drop(store);
            Err(e)
        }
    };
    // A half-built store must not look finished to the next run
    let unwritten = match closed {
        Ok(pending) => pending.len(),
        Err(e) => {
            discard_partial_store(output, lifecycle);
            return Err(e);
        }
    };
    if unwritten > 0 {
        log::warn!(
            "{} trailing rows of {} did not fill a chunk and were not written",
            unwritten,
            output.display()
        );
    }

    record(
        trace,
        TraceEntry::new(output, TraceStage::Complete, 1.0, "Closed store")
            .with_data(serde_json::json!({ "examples": examples, "unwritten": unwritten })),
    );
    Ok(JobStatus::Completed {
        examples,
        unwritten,
    })
}

/// Append every batch of `source`, then shuffle if requested
fn fill_store(
    store: &mut FeatureStore,
    source: &mut dyn RowSource,
    options: &CompileOptions,
    output: &Path,
    trace: Option<&TraceWriter>,
) -> PipelineResult<()> {
    while let Some(batch) = source.next_batch()? {
        let before = store.example_count();
        store.append_rows(batch)?;
        if store.example_count() != before {
            record(
                trace,
                TraceEntry::new(output, TraceStage::Append, 0.0, "Flushed chunks")
                    .with_data(serde_json::json!({ "examples": store.example_count() })),
            );
        }
    }

    if let Some(shuffle) = &options.shuffle {
        let mut observer = |fraction: f64| {
            log::debug!("Shuffling {}: {:.0}%", output.display(), fraction * 100.0);
        };
        let report = store.shuffle(shuffle, Some(&mut observer))?;
        record(
            trace,
            TraceEntry::new(output, TraceStage::Shuffle, 1.0, "Shuffled").with_data(
                serde_json::json!({
                    "steps": report.steps,
                    "shuffle_chunk_size": report.shuffle_chunk_size,
                }),
            ),
        );
    }
    Ok(())
}

fn discard_partial_store(output: &Path, lifecycle: &Mutex<()>) {
    let _guard = lock(lifecycle);
    match container::remove_container_files(output) {
        Ok(()) => log::info!("Removed partial store {}", output.display()),
        Err(e) => log::warn!("Failed to remove partial store {}: {}", output.display(), e),
    }
}

fn lock(lifecycle: &Mutex<()>) -> MutexGuard<'_, ()> {
    lifecycle.lock().unwrap_or_else(|e| e.into_inner())
}

fn record(trace: Option<&TraceWriter>, entry: TraceEntry) {
    if let Some(writer) = trace {
        writer.record(entry);
    }
}

/// Default output path for an input file: same location, `.db` extension
pub fn store_path_for(input: &Path) -> PathBuf {
    input.with_extension("db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::trace::read_trace_file;
    use crate::store::Label;
    use tempfile::TempDir;

    struct FailingSource {
        batches_left: usize,
    }

    impl RowSource for FailingSource {
        fn next_batch(&mut self) -> PipelineResult<Option<Vec<Row>>> {
            if self.batches_left == 0 {
                return Err(PipelineError::Source("decoder gave up".to_string()));
            }
            self.batches_left -= 1;
            Ok(Some(rows(0, 4, "bad.wav")))
        }
    }

    fn rows(start: i64, count: i64, file: &str) -> Vec<Row> {
        (start..start + count)
            .map(|i| Row::new(Label::Class(i), i, file).with_feature("spectrum", vec![i as f64; 2]))
            .collect()
    }

    fn options(dir: &TempDir) -> CompileOptions {
        let mut options = CompileOptions::new(Schema::with_features(&[("spectrum", 2)]).unwrap());
        options.chunk_size = 4;
        options.trace_path = Some(dir.path().join("trace.jsonl"));
        options
    }

    #[test]
    fn test_memory_source_batches() {
        let mut source = MemorySource::new(rows(0, 5, "a.wav"), 2);
        let sizes: Vec<usize> = std::iter::from_fn(|| source.next_batch().unwrap())
            .map(|batch| batch.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_store_path_for() {
        assert_eq!(
            store_path_for(Path::new("audio/piano/60.wav")),
            PathBuf::from("audio/piano/60.db")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_isolated_per_store() {
        let dir = TempDir::new().unwrap();
        let jobs = vec![
            CompileJob::new(dir.path().join("a.db"), MemorySource::new(rows(0, 10, "a.wav"), 3)),
            CompileJob::new(dir.path().join("b.db"), FailingSource { batches_left: 1 }),
            CompileJob::new(dir.path().join("c.db"), MemorySource::new(rows(0, 8, "c.wav"), 8)),
        ];

        let outcomes = compile_stores(jobs, options(&dir)).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[0].status,
            JobStatus::Completed {
                examples: 8,
                unwritten: 2
            }
        );
        assert!(matches!(&outcomes[1].status, JobStatus::Failed(msg) if msg.contains("decoder")));
        assert_eq!(
            outcomes[2].status,
            JobStatus::Completed {
                examples: 8,
                unwritten: 0
            }
        );

        let schema = Schema::with_features(&[("spectrum", 2)]).unwrap();
        let store_options = StoreOptions {
            chunk_size: 4,
            ..StoreOptions::default()
        };
        let store = FeatureStore::open(dir.path().join("c.db"), schema, store_options).unwrap();
        assert_eq!(store.read_rows(0, 8).unwrap(), rows(0, 8, "c.wav"));

        let entries = read_trace_file(&dir.path().join("trace.jsonl")).unwrap();
        assert!(entries.iter().any(|e| e.stage == TraceStage::Failed && e.store.ends_with("b.db")));
        assert_eq!(entries.iter().filter(|e| e.stage == TraceStage::Complete).count(), 2);
    }

    #[tokio::test]
    async fn test_failed_store_is_rebuilt_on_next_run() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("retry.db");

        let first = compile_stores(
            vec![CompileJob::new(&output, FailingSource { batches_left: 1 })],
            options(&dir),
        )
        .await;
        assert!(matches!(first[0].status, JobStatus::Failed(_)));
        assert!(!output.exists());
        assert!(!dir.path().join("retry.db-wal").exists());

        let second = compile_stores(
            vec![CompileJob::new(&output, MemorySource::new(rows(0, 8, "retry.wav"), 3))],
            options(&dir),
        )
        .await;
        assert_eq!(
            second[0].status,
            JobStatus::Completed {
                examples: 8,
                unwritten: 0
            }
        );
    }

    #[tokio::test]
    async fn test_existing_outputs_skipped_unless_overwrite() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("a.db");

        let first = compile_stores(
            vec![CompileJob::new(&output, MemorySource::new(rows(0, 4, "a.wav"), 4))],
            options(&dir),
        )
        .await;
        assert!(matches!(first[0].status, JobStatus::Completed { examples: 4, .. }));

        let second = compile_stores(
            vec![CompileJob::new(&output, MemorySource::new(rows(0, 8, "a.wav"), 4))],
            options(&dir),
        )
        .await;
        assert_eq!(second[0].status, JobStatus::Skipped);

        let mut overwrite = options(&dir);
        overwrite.overwrite = true;
        let third = compile_stores(
            vec![CompileJob::new(&output, MemorySource::new(rows(0, 8, "a.wav"), 4))],
            overwrite,
        )
        .await;
        assert!(matches!(third[0].status, JobStatus::Completed { examples: 8, .. }));
    }

    #[tokio::test]
    async fn test_compile_with_shuffle() {
        let dir = TempDir::new().unwrap();
        let mut options = options(&dir);
        options.shuffle = Some(ShuffleOptions {
            chunk_size: 2,
            seed: Some(17),
            ..ShuffleOptions::default()
        });
        let schema = options.schema.clone();

        let outcomes = compile_stores(
            vec![CompileJob::new(
                dir.path().join("s.db"),
                MemorySource::new(rows(0, 12, "s.wav"), 5),
            )],
            options,
        )
        .await;
        assert!(matches!(outcomes[0].status, JobStatus::Completed { examples: 12, .. }));

        let store_options = StoreOptions {
            chunk_size: 4,
            ..StoreOptions::default()
        };
        let store = FeatureStore::open(dir.path().join("s.db"), schema, store_options).unwrap();
        let shuffled = store.read_rows(0, 12).unwrap();
        let mut offsets: Vec<i64> = shuffled.iter().map(|r| r.offset).collect();
        for row in &shuffled {
            assert_eq!(row.label, Label::Class(row.offset));
            assert_eq!(row.features["spectrum"], vec![row.offset as f64; 2]);
        }
        offsets.sort_unstable();
        assert_eq!(offsets, (0..12).collect::<Vec<_>>());

        let entries = read_trace_file(&dir.path().join("trace.jsonl")).unwrap();
        let shuffle = entries.iter().find(|e| e.stage == TraceStage::Shuffle).unwrap();
        assert_eq!(shuffle.data.as_ref().unwrap()["steps"], 6);
    }
}
