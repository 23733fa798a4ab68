//! The batch specification iterator contract and the stock random sampler.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::item::{Batch, BatchItem, RoundingMode, SourceId, TimeSpan};
use crate::select::ChannelSelector;
use crate::state::IterationState;

/// A restartable, deterministic source of batch specifications.
///
/// `next_item` must be a pure function of `(self, state)`: no clocks, no
/// process identity, no interior mutation. Returning `None` ends the
/// iteration. Implementations may override `next_batch` when composing
/// items one at a time is wasteful.
pub trait BatchIterator: Send + Sync + 'static {
    type State: IterationState;

    /// Items per batch.
    fn batch_size(&self) -> usize;

    /// Produce the next item and the state after it, or `None` at the end.
    fn next_item(&self, state: Self::State) -> Option<(BatchItem, Self::State)>;

    /// Produce the next batch: the `batch_size`-fold composition of
    /// [`next_item`](BatchIterator::next_item).
    fn next_batch(&self, state: Self::State) -> Option<(Batch, Self::State)> {
        let mut state = state;
        let mut items = Vec::with_capacity(self.batch_size());
        for _ in 0..self.batch_size() {
            let (item, next) = self.next_item(state)?;
            items.push(item);
            state = next;
        }
        Some((items, state))
    }
}

/// Static description of one recording available for sampling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: SourceId,
    pub duration_ms: u64,
    pub channels: Vec<String>,
    pub sample_rate: f64,
    pub label_rate: f64,
}

/// Infinite random-window sampler over a set of recordings.
///
/// Each step derives a generator from the [`SeedState`](crate::SeedState),
/// draws a recording (weighted), a window start, and a channel subset, and
/// advances the state. Equal states therefore always reproduce the same
/// item.
#[derive(Clone, Debug)]
pub struct RandomBatches {
    recordings: Vec<Recording>,
    weights: WeightedIndex<f64>,
    channels_per_item: usize,
    batch_size: usize,
    batch_duration_ms: u64,
    rounding: RoundingMode,
}

impl RandomBatches {
    /// Uniformly-weighted sampler drawing one channel per item.
    pub fn new(
        recordings: Vec<Recording>,
        batch_size: usize,
        batch_duration_ms: u64,
    ) -> Result<Self, BatchError> {
        if recordings.is_empty() {
            return Err(BatchError::invalid("no recordings to sample"));
        }
        if batch_size == 0 {
            return Err(BatchError::invalid("batch size must be positive"));
        }
        if batch_duration_ms == 0 {
            return Err(BatchError::invalid("batch duration must be positive"));
        }
        for recording in &recordings {
            if recording.channels.is_empty() {
                return Err(BatchError::invalid(format!(
                    "recording {} has no channels",
                    recording.id
                )));
            }
            if recording.duration_ms < batch_duration_ms {
                return Err(BatchError::invalid(format!(
                    "recording {} is shorter ({} ms) than the batch window ({} ms)",
                    recording.id, recording.duration_ms, batch_duration_ms
                )));
            }
        }

        let weights = WeightedIndex::new(vec![1.0; recordings.len()])
            .map_err(|e| BatchError::invalid(e.to_string()))?;

        Ok(Self {
            recordings,
            weights,
            channels_per_item: 1,
            batch_size,
            batch_duration_ms,
            rounding: RoundingMode::Exact,
        })
    }

    /// Replace the per-recording sampling weights.
    pub fn with_weights(mut self, weights: Vec<f64>) -> Result<Self, BatchError> {
        if weights.len() != self.recordings.len() {
            return Err(BatchError::invalid(format!(
                "{} weights for {} recordings",
                weights.len(),
                self.recordings.len()
            )));
        }
        self.weights = WeightedIndex::new(weights).map_err(|e| BatchError::invalid(e.to_string()))?;
        Ok(self)
    }

    /// Draw `n` distinct channels per item instead of one.
    pub fn with_channels_per_item(mut self, n: usize) -> Result<Self, BatchError> {
        let narrowest = self
            .recordings
            .iter()
            .map(|r| r.channels.len())
            .min()
            .unwrap_or(0);
        if n == 0 || n > narrowest {
            return Err(BatchError::invalid(format!(
                "cannot draw {n} channels; narrowest recording has {narrowest}"
            )));
        }
        self.channels_per_item = n;
        Ok(self)
    }

    /// Set the alignment rule stamped on every produced item.
    pub fn with_rounding(mut self, rounding: RoundingMode) -> Self {
        self.rounding = rounding;
        self
    }
}

impl BatchIterator for RandomBatches {
    type State = crate::state::SeedState;

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn next_item(&self, state: Self::State) -> Option<(BatchItem, Self::State)> {
        let mut rng = state.rng();

        let recording = &self.recordings[self.weights.sample(&mut rng)];
        let start_ms = rng.gen_range(0..=recording.duration_ms - self.batch_duration_ms);
        let span = TimeSpan {
            start_ms,
            end_ms: start_ms + self.batch_duration_ms,
        };

        let picked = rand::seq::index::sample(
            &mut rng,
            recording.channels.len(),
            self.channels_per_item,
        );
        let channels = picked
            .into_iter()
            .map(|i| recording.channels[i].clone())
            .collect::<Vec<_>>();

        let item = BatchItem {
            source: recording.id.clone(),
            span,
            label_span: span,
            channels: ChannelSelector::Named { channels },
            sample_rate: recording.sample_rate,
            label_rate: recording.label_rate,
            rounding: self.rounding,
        };
        Some((item, state.advance()))
    }
}
