//! Channel selection: how an item maps decoded rows to its signal tensor.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Decoded multichannel data with named rows, shape `(channels, frames)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Samples {
    channels: Vec<String>,
    data: Array2<f32>,
    sample_rate: f64,
}

impl Samples {
    /// Bind channel names to rows; the row count must match.
    pub fn new(
        channels: Vec<String>,
        data: Array2<f32>,
        sample_rate: f64,
    ) -> Result<Self, BatchError> {
        if channels.len() != data.len_of(Axis(0)) {
            return Err(BatchError::invalid(format!(
                "{} channel names for {} rows",
                channels.len(),
                data.len_of(Axis(0))
            )));
        }
        Ok(Self {
            channels,
            data,
            sample_rate,
        })
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c == name)
    }
}

/// The channel selector embedded in each batch item.
///
/// Selectors are tagged values so items stay serializable across process
/// boundaries; [`select`](ChannelSelector::select) dispatches on the tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelSelector {
    /// Select the listed channels by name; absence is an error.
    Named { channels: Vec<String> },
    /// Select the half-open row range `start..end`.
    Range { start: usize, end: usize },
    /// Like `Named`, but absent channels materialize as all-zero rows.
    ZeroFill { channels: Vec<String> },
}

impl ChannelSelector {
    pub fn named<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ChannelSelector::Named {
            channels: channels.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of rows the selection produces.
    pub fn count(&self) -> usize {
        match self {
            ChannelSelector::Named { channels } | ChannelSelector::ZeroFill { channels } => {
                channels.len()
            }
            ChannelSelector::Range { start, end } => end.saturating_sub(*start),
        }
    }

    /// Apply the selection, producing a `(count, frames)` tensor.
    pub fn select(&self, samples: &Samples) -> Result<Array2<f32>, BatchError> {
        match self {
            ChannelSelector::Named { channels } => {
                let mut rows = Vec::with_capacity(channels.len());
                for name in channels {
                    let row = samples.index_of(name).ok_or_else(|| {
                        BatchError::invalid(format!("channel {name} not present in source"))
                    })?;
                    rows.push(row);
                }
                Ok(samples.data.select(Axis(0), &rows))
            }
            ChannelSelector::Range { start, end } => {
                let total = samples.data.len_of(Axis(0));
                if *start > *end || *end > total {
                    return Err(BatchError::invalid(format!(
                        "channel range {start}..{end} out of bounds for {total} channels"
                    )));
                }
                Ok(samples.data.slice(ndarray::s![*start..*end, ..]).to_owned())
            }
            ChannelSelector::ZeroFill { channels } => {
                let mut out = Array2::zeros((channels.len(), samples.frames()));
                for (i, name) in channels.iter().enumerate() {
                    if let Some(row) = samples.index_of(name) {
                        out.row_mut(i).assign(&samples.data.row(row));
                    }
                }
                Ok(out)
            }
        }
    }
}
