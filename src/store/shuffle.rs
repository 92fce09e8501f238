// Paired-window shuffle
// Approximates a uniform permutation of all durable rows in place on disk,
// holding at most two windows of rows in memory at a time

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::container;
use super::database::FeatureStore;
use super::error::{StoreError, StoreResult};
use super::row::ColumnData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleOptions {
    /// Rows per shuffle window, clamped to half the example count
    pub chunk_size: usize,

    /// Repeat factor for the number of steps in a pass
    pub passes: usize,

    /// Checkpoint the container after every step instead of once per pass
    pub sync_every_step: bool,

    /// Seed for a reproducible pass; `None` seeds from the OS
    pub seed: Option<u64>,
}

impl Default for ShuffleOptions {
    fn default() -> Self {
        ShuffleOptions {
            chunk_size: 1024,
            passes: 1,
            sync_every_step: false,
            seed: None,
        }
    }
}

/// Summary of a completed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleReport {
    pub steps: usize,
    pub shuffle_chunk_size: usize,
}

/// Rows exchanged by one step: the sweeping window, plus the part of the
/// random window that does not overlap it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepWindows {
    first_start: usize,
    first_len: usize,
    second_start: usize,
    second_len: usize,
}

impl StepWindows {
    fn new(start1: usize, start2: usize, size: usize) -> Self {
        let (second_start, second_end) = if start2 + size <= start1 || start2 >= start1 + size {
            (start2, start2 + size)
        } else if start2 < start1 {
            (start2, start1)
        } else {
            (start1 + size, start2 + size)
        };

        StepWindows {
            first_start: start1,
            first_len: size,
            second_start,
            second_len: second_end - second_start,
        }
    }

    fn total(&self) -> usize {
        self.first_len + self.second_len
    }
}

impl FeatureStore {
    /// Shuffle durable rows in place. Pending rows are untouched.
    pub fn shuffle(
        &mut self,
        options: &ShuffleOptions,
        progress: Option<&mut dyn FnMut(f64)>,
    ) -> StoreResult<ShuffleReport> {
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        self.shuffle_with_rng(options, &mut rng, progress)
    }

    pub fn shuffle_with_rng<R: Rng + ?Sized>(
        &mut self,
        options: &ShuffleOptions,
        rng: &mut R,
        progress: Option<&mut dyn FnMut(f64)>,
    ) -> StoreResult<ShuffleReport> {
        self.check_usable()?;
        if options.chunk_size == 0 {
            return Err(StoreError::InvalidChunkSize(options.chunk_size));
        }
        if options.passes.checked_mul(self.example_count).is_none() {
            return Err(StoreError::InvalidPasses {
                passes: options.passes,
                example_count: self.example_count,
            });
        }
        let result = self.run_pass(options, rng, progress);
        self.guard(result)
    }

    fn run_pass<R: Rng + ?Sized>(
        &mut self,
        options: &ShuffleOptions,
        rng: &mut R,
        mut progress: Option<&mut dyn FnMut(f64)>,
    ) -> StoreResult<ShuffleReport> {
        let example_count = self.example_count;
        if example_count < 2 {
            return Ok(ShuffleReport {
                steps: 0,
                shuffle_chunk_size: 0,
            });
        }

        let size = options.chunk_size.min(example_count / 2);
        let steps = options.passes.saturating_mul(example_count) / size;
        let mut indices: Vec<usize> = Vec::with_capacity(2 * size);

        for i in 0..steps {
            let start1 = (i * size) % (example_count - size + 1);
            let start2 = rng.random_range(0..=example_count - size);
            let windows = StepWindows::new(start1, start2, size);

            indices.clear();
            indices.extend(0..windows.total());
            indices.shuffle(rng);

            self.shuffle_step(&windows, &indices)?;
            if options.sync_every_step {
                container::checkpoint(&self.conn)?;
            }

            log::debug!(
                "Shuffle step {}/{}: rows {}+{} with {}+{}",
                i + 1,
                steps,
                windows.first_start,
                windows.first_len,
                windows.second_start,
                windows.second_len
            );

            if let Some(observer) = progress.as_deref_mut() {
                let fraction = if steps > 1 {
                    i as f64 / (steps - 1) as f64
                } else {
                    1.0
                };
                observer(fraction);
            }
        }

        container::checkpoint(&self.conn)?;
        log::info!(
            "Shuffled {} examples in {} ({} steps of {} rows)",
            example_count,
            self.path().display(),
            steps,
            size
        );

        Ok(ShuffleReport {
            steps,
            shuffle_chunk_size: size,
        })
    }

    /// Permute the rows of both windows identically across every column,
    /// in a single transaction
    fn shuffle_step(&mut self, windows: &StepWindows, indices: &[usize]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;

        for table in &mut self.tables {
            let width = table.width();
            let mut buffer: ColumnData = table.read_slice(&tx, windows.first_start, windows.first_len)?;
            let second = table.read_slice(&tx, windows.second_start, windows.second_len)?;
            buffer.extend_rows(&second, width, 0, windows.second_len)?;

            for (k, &index) in indices.iter().enumerate() {
                if index != k {
                    buffer.swap_rows(width, k, index);
                }
            }

            table.write_slice(&tx, windows.first_start, &buffer, 0, windows.first_len)?;
            table.write_slice(&tx, windows.second_start, &buffer, windows.first_len, windows.second_len)?;
        }

        tx.commit()?;
        Ok(())
    }
}
