//! Batch items: the cheap, serializable descriptors of what to load.

use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::select::ChannelSelector;

/// Identifier of a recording, file path, or object URL.
pub type SourceId = String;

/// How fractional sample boundaries are resolved when a millisecond span is
/// translated to sample indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Reject misaligned boundaries with `InvalidArgument`.
    #[default]
    Exact,
    /// Round boundaries down to the previous sample.
    Floor,
    /// Round boundaries to the nearest sample.
    Nearest,
}

/// Half-open millisecond window `[start_ms, end_ms)` into a recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeSpan {
    /// Build a span, rejecting empty or unsorted bounds.
    pub fn new(start_ms: u64, end_ms: u64) -> Result<Self, BatchError> {
        if start_ms >= end_ms {
            return Err(BatchError::invalid(format!(
                "unsorted span: {start_ms}..{end_ms}"
            )));
        }
        Ok(Self { start_ms, end_ms })
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }

    /// Translate to a `(first_sample, sample_count)` pair at `rate_hz`.
    ///
    /// Alignment of the boundaries is resolved by `mode`; `Exact` fails on
    /// any fractional boundary so that silent drift between code paths is
    /// impossible.
    pub fn sample_range(
        &self,
        rate_hz: f64,
        mode: RoundingMode,
    ) -> Result<(u64, u64), BatchError> {
        if !(rate_hz.is_finite() && rate_hz > 0.0) {
            return Err(BatchError::invalid(format!("bad sample rate: {rate_hz}")));
        }

        let first = resolve(self.start_ms as f64 * rate_hz / 1000.0, mode)?;
        let last = resolve(self.end_ms as f64 * rate_hz / 1000.0, mode)?;
        Ok((first, last - first))
    }
}

fn resolve(boundary: f64, mode: RoundingMode) -> Result<u64, BatchError> {
    const EPS: f64 = 1e-9;
    match mode {
        RoundingMode::Exact => {
            let nearest = boundary.round();
            if (boundary - nearest).abs() > EPS {
                return Err(BatchError::invalid(format!(
                    "misaligned sample boundary: {boundary}"
                )));
            }
            Ok(nearest as u64)
        }
        RoundingMode::Floor => Ok((boundary + EPS).floor() as u64),
        RoundingMode::Nearest => Ok(boundary.round() as u64),
    }
}

/// Specification for one sample of a batch.
///
/// Items are produced sequentially by the iterator, shipped to workers, and
/// must round-trip through serialization unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Recording id, file path, or URL the sample comes from.
    pub source: SourceId,
    /// Signal window to load.
    pub span: TimeSpan,
    /// Label window to load.
    pub label_span: TimeSpan,
    /// Which signal channels the item selects.
    pub channels: ChannelSelector,
    /// Signal sample rate in Hz.
    pub sample_rate: f64,
    /// Label sample rate in Hz.
    pub label_rate: f64,
    /// Alignment rule applied when spans are converted to sample indices.
    #[serde(default)]
    pub rounding: RoundingMode,
}

/// An ordered run of items materialized together.
///
/// A batch has no identity beyond its position in the iteration.
pub type Batch = Vec<BatchItem>;
