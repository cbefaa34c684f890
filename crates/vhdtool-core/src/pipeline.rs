//! Parallel block processing.
//!
//! The pipeline fans a batch of independent work items out over a rayon
//! thread pool and collects the results in input order. Conversion uses it
//! for reading and zero-checking blocks; allocation and writes stay on the
//! caller's thread.

use std::ops::Range;

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Default number of blocks processed per batch.
pub const DEFAULT_BATCH_BLOCKS: usize = 16;

/// Configuration for the processing pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Items handed to the pool at once. Bounds memory to
    /// `batch_blocks × block_size` during conversion.
    pub batch_blocks: usize,
    /// Worker threads (0 = rayon's default).
    pub num_threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_blocks: DEFAULT_BATCH_BLOCKS,
            num_threads: 0,
        }
    }
}

impl PipelineConfig {
    /// Create a new pipeline configuration.
    pub fn new(batch_blocks: usize, num_threads: usize) -> Self {
        Self {
            batch_blocks: batch_blocks.max(1),
            num_threads,
        }
    }
}

/// Order-preserving parallel processor.
pub struct Pipeline {
    config: PipelineConfig,
    /// Dedicated pool when a thread count was requested; otherwise the
    /// global rayon pool is used.
    pool: Option<rayon::ThreadPool>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl Pipeline {
    /// Create a pipeline from a configuration.
    ///
    /// If a dedicated pool cannot be built the global pool is used instead.
    pub fn new(config: PipelineConfig) -> Self {
        let pool = match config.num_threads {
            0 => None,
            n => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!(threads = n, error = %e, "falling back to global thread pool");
                    None
                }
            },
        };
        Self { config, pool }
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Items per batch.
    pub fn batch_size(&self) -> usize {
        self.config.batch_blocks.max(1)
    }

    /// Number of worker threads actually in use.
    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Applies `f` to every item in parallel, returning results in input order.
    ///
    /// `f` receives the item's position in `items`. The first error aborts
    /// the batch and is returned.
    pub fn process<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> Result<R> + Sync + Send,
    {
        let run = || {
            items
                .into_par_iter()
                .enumerate()
                .map(|(idx, item)| f(idx, item))
                .collect::<Result<Vec<R>>>()
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    /// Splits `0..total` into consecutive batches of at most `batch_size()`.
    pub fn batches(&self, total: u32) -> impl Iterator<Item = Range<u32>> {
        let step = u32::try_from(self.batch_size()).unwrap_or(u32::MAX);
        (0..total)
            .step_by(step as usize)
            .map(move |start| start..start.saturating_add(step).min(total))
    }
}

/// Checks that a batch produced one result per item.
pub(crate) fn ensure_complete<R>(results: &[R], expected: usize) -> Result<()> {
    if results.len() != expected {
        return Err(Error::pipeline(format!(
            "batch produced {} results, expected {}",
            results.len(),
            expected
        )));
    }
    Ok(())
}
