//! Deterministic fixtures shared by the crate's tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::Array2;

use crate::error::BatchError;
use crate::item::{BatchItem, RoundingMode, TimeSpan};
use crate::iterator::BatchIterator;
use crate::materialize::Materializer;
use crate::pool::WorkerPool;
use crate::retry::RetryConfig;
use crate::select::{ChannelSelector, Samples};
use crate::state::SeedState;
use crate::worker::spawn_worker;

/// Milliseconds per fixture item window.
pub(crate) const GRID_WINDOW_MS: u64 = 10;

/// A finite iterator producing `batches` windows laid out back to back.
///
/// Step `k` yields a two-channel window `[k·10, (k+1)·10)` over one of
/// three synthetic recordings, so sequences are fully determined by the
/// state and easy to replay.
pub(crate) struct FiniteGrid {
    batches: u64,
    batch_size: usize,
}

impl FiniteGrid {
    pub(crate) fn new(batches: u64, batch_size: usize) -> Self {
        Self {
            batches,
            batch_size,
        }
    }
}

impl BatchIterator for FiniteGrid {
    type State = SeedState;

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn next_item(&self, state: SeedState) -> Option<(BatchItem, SeedState)> {
        let step = state.step();
        if step >= self.batches * self.batch_size as u64 {
            return None;
        }
        Some((grid_item(step), state.advance()))
    }
}

/// The item `FiniteGrid` yields at `step`.
pub(crate) fn grid_item(step: u64) -> BatchItem {
    let start_ms = step * GRID_WINDOW_MS;
    let span = TimeSpan {
        start_ms,
        end_ms: start_ms + GRID_WINDOW_MS,
    };
    BatchItem {
        source: format!("rec-{}", step % 3),
        span,
        label_span: span,
        channels: ChannelSelector::named(["g0", "g1"]),
        sample_rate: 1000.0,
        label_rate: 100.0,
        rounding: RoundingMode::Exact,
    }
}

/// A whole batch of consecutive grid items starting at `first_step`.
pub(crate) fn grid_batch(batch_size: u64, first_step: u64) -> Vec<BatchItem> {
    (first_step..first_step + batch_size).map(grid_item).collect()
}

/// Pure synthetic materializer: every sample value is a function of the
/// item's source, window, and channel, so equal items always produce equal
/// tensors regardless of where they are loaded.
pub(crate) struct GridSource {
    fail_from_ms: Option<u64>,
    flaky_remaining: AtomicU32,
}

impl GridSource {
    pub(crate) fn new() -> Self {
        Self {
            fail_from_ms: None,
            flaky_remaining: AtomicU32::new(0),
        }
    }

    /// Fail with `Open` for any item whose window starts at or past
    /// `start_ms`.
    pub(crate) fn failing_from(start_ms: u64) -> Self {
        Self {
            fail_from_ms: Some(start_ms),
            ..Self::new()
        }
    }

    /// Fail the first `n` loads with a transient error, then recover.
    pub(crate) fn flaky(n: u32) -> Self {
        Self {
            fail_from_ms: None,
            flaky_remaining: AtomicU32::new(n),
        }
    }
}

fn source_tag(source: &str) -> f32 {
    source.bytes().map(f32::from).sum()
}

#[async_trait]
impl Materializer for GridSource {
    async fn load_item_samples(
        &self,
        item: &BatchItem,
    ) -> Result<(Samples, Samples), BatchError> {
        if self
            .flaky_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BatchError::Transient("synthetic hiccup".into()));
        }
        if let Some(from) = self.fail_from_ms {
            if item.span.start_ms >= from {
                return Err(BatchError::Open {
                    path: item.source.clone(),
                    message: "synthetic open failure".into(),
                });
            }
        }

        let names = match &item.channels {
            ChannelSelector::Named { channels } => channels.clone(),
            other => {
                return Err(BatchError::invalid(format!(
                    "fixture supports named selectors only, got {other:?}"
                )))
            }
        };

        let tag = source_tag(&item.source) + item.span.start_ms as f32;
        let (_, frames) = item.span.sample_range(item.sample_rate, item.rounding)?;
        let data = Array2::from_shape_fn((names.len(), frames as usize), |(c, t)| {
            tag + c as f32 * 100.0 + t as f32
        });
        let samples = Samples::new(names, data, item.sample_rate)?;

        let (_, label_frames) = item
            .label_span
            .sample_range(item.label_rate, item.rounding)?;
        let labels = Samples::new(
            vec!["label".into()],
            Array2::from_elem((1, label_frames as usize), tag),
            item.label_rate,
        )?;
        Ok((samples, labels))
    }
}

/// Spawn `n` workers sharing one materializer, pooled in id order.
pub(crate) fn spawn_pool(
    n: usize,
    source: GridSource,
) -> (WorkerPool, Vec<tokio::task::JoinHandle<()>>) {
    let source: Arc<dyn Materializer> = Arc::new(source);
    let mut workers = Vec::new();
    let mut tasks = Vec::new();
    for id in 0..n {
        let (worker, task) = spawn_worker(id, Arc::clone(&source), RetryConfig::default());
        workers.push(worker);
        tasks.push(task);
    }
    (WorkerPool::new(workers), tasks)
}
