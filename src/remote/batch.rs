//! Chunked, bounded-concurrency fan-out for large id sets.

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use tracing::{debug, warn};

use super::error::ApiError;

/// Maximum ids the remote batch endpoint accepts per call
pub const BATCH_CEILING: usize = 200;

/// A de-duplicated, sorted set of items split into fixed-size chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob<T> {
  items: Vec<T>,
  batch_size: usize,
  max_concurrency: usize,
}

impl<T: Ord + Clone> BatchJob<T> {
  pub fn new(items: impl IntoIterator<Item = T>, batch_size: usize, max_concurrency: usize) -> Self {
    let items: Vec<T> = items.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    Self {
      items,
      batch_size: batch_size.max(1),
      max_concurrency: max_concurrency.max(1),
    }
  }

  pub fn items(&self) -> &[T] {
    &self.items
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  pub fn max_concurrency(&self) -> usize {
    self.max_concurrency
  }

  pub fn chunks(&self) -> impl Iterator<Item = Vec<T>> + '_ {
    self.items.chunks(self.batch_size).map(<[T]>::to_vec)
  }

  pub fn chunk_count(&self) -> usize {
    self.items.len().div_ceil(self.batch_size)
  }
}

/// How a failing chunk affects its siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
  /// Record the failure and keep going
  #[default]
  Isolate,
  /// Stop at the first failing chunk
  FailFast,
}

#[derive(Debug)]
pub struct ChunkFailure<T> {
  pub items: Vec<T>,
  pub error: ApiError,
}

#[derive(Debug)]
pub struct BatchOutcome<T, R> {
  pub results: Vec<R>,
  pub failures: Vec<ChunkFailure<T>>,
  pub chunks: usize,
}

impl<T, R> BatchOutcome<T, R> {
  pub fn failed_items(&self) -> impl Iterator<Item = &T> {
    self.failures.iter().flat_map(|f| f.items.iter())
  }
}

#[derive(Debug, Clone)]
pub struct BatchProcessor {
  batch_size: usize,
  max_concurrency: usize,
}

impl BatchProcessor {
  pub fn new(batch_size: usize, max_concurrency: usize) -> Self {
    Self {
      batch_size: batch_size.clamp(1, BATCH_CEILING),
      max_concurrency: max_concurrency.max(1),
    }
  }

  /// Same chunking with a different concurrency cap
  pub fn with_concurrency(&self, max_concurrency: usize) -> Self {
    Self::new(self.batch_size, max_concurrency)
  }

  pub fn max_concurrency(&self) -> usize {
    self.max_concurrency
  }

  /// Run `worker` once per chunk with at most `max_concurrency` chunks in flight.
  ///
  /// Result order across chunks follows completion order, not input order.
  pub async fn process<T, R, F, Fut>(
    &self,
    items: impl IntoIterator<Item = T>,
    mode: FailureMode,
    worker: F,
  ) -> Result<BatchOutcome<T, R>, ApiError>
  where
    T: Ord + Clone,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<R>, ApiError>>,
  {
    let job = BatchJob::new(items, self.batch_size, self.max_concurrency);
    let chunks = job.chunk_count();
    let mut outcome = BatchOutcome {
      results: Vec::new(),
      failures: Vec::new(),
      chunks,
    };
    if job.is_empty() {
      return Ok(outcome);
    }

    debug!(
      items = job.items().len(),
      chunks,
      concurrency = job.max_concurrency(),
      "Processing batches"
    );

    let mut in_flight = stream::iter(job.chunks())
      .map(|chunk| {
        let work = worker(chunk.clone());
        async move { (chunk, work.await) }
      })
      .buffer_unordered(job.max_concurrency());

    while let Some((chunk, result)) = in_flight.next().await {
      match result {
        Ok(mut results) => outcome.results.append(&mut results),
        Err(error) if mode == FailureMode::FailFast => return Err(error),
        Err(error) => {
          warn!(chunk_len = chunk.len(), error = %error, "Batch chunk failed, continuing with the rest");
          outcome.failures.push(ChunkFailure { items: chunk, error });
        }
      }
    }

    Ok(outcome)
  }
}
