//! Materialization: turning batch items into dense training tensors.

use async_trait::async_trait;
use futures::future::try_join_all;
use ndarray::{Array2, Array3, Axis};

use crate::error::BatchError;
use crate::item::{Batch, BatchItem};
use crate::select::Samples;

/// A materialized batch: signals `(C, T, B)` and labels `(L, T_y, B)`.
///
/// The trailing axis is always the batch axis produced by stacking.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterializedBatch {
    pub signals: Array3<f32>,
    pub labels: Array3<f32>,
}

impl MaterializedBatch {
    pub fn batch_size(&self) -> usize {
        self.signals.len_of(Axis(2))
    }
}

/// The expensive I/O plug-in: fetches the decoded signal and label windows
/// for one item.
///
/// Implementations must return data covering exactly `item.span` and
/// `item.label_span`; the driver validates widths against the item's rates.
#[async_trait]
pub trait Materializer: Send + Sync + 'static {
    async fn load_item_samples(&self, item: &BatchItem)
        -> Result<(Samples, Samples), BatchError>;
}

/// Load one item and slice it into per-item `(x, y)` tensors.
pub async fn materialize_item<M>(
    materializer: &M,
    item: &BatchItem,
) -> Result<(Array2<f32>, Array2<f32>), BatchError>
where
    M: Materializer + ?Sized,
{
    let (samples, labels) = materializer.load_item_samples(item).await?;

    let x = item.channels.select(&samples)?;
    let (_, want_x) = item.span.sample_range(item.sample_rate, item.rounding)?;
    if x.len_of(Axis(1)) as u64 != want_x {
        return Err(BatchError::invalid(format!(
            "source {} returned {} signal frames for a {}-frame window",
            item.source,
            x.len_of(Axis(1)),
            want_x
        )));
    }

    let y = labels.data().clone();
    let (_, want_y) = item.label_span.sample_range(item.label_rate, item.rounding)?;
    if y.len_of(Axis(1)) as u64 != want_y {
        return Err(BatchError::invalid(format!(
            "source {} returned {} label frames for a {}-frame window",
            item.source,
            y.len_of(Axis(1)),
            want_y
        )));
    }

    Ok((x, y))
}

/// Materialize every item of a batch concurrently and stack the per-item
/// tensors on a new trailing axis.
///
/// All items must produce identical per-item shapes; the first disagreement
/// fails `ShapeMismatch`.
pub async fn materialize_batch<M>(
    materializer: &M,
    batch: &Batch,
) -> Result<MaterializedBatch, BatchError>
where
    M: Materializer + ?Sized,
{
    if batch.is_empty() {
        return Err(BatchError::invalid("cannot materialize an empty batch"));
    }

    let pairs = try_join_all(
        batch
            .iter()
            .map(|item| materialize_item(materializer, item)),
    )
    .await?;

    let (x0, y0) = &pairs[0];
    for (index, (x, y)) in pairs.iter().enumerate() {
        if x.dim() != x0.dim() {
            return Err(shape_mismatch(index, x0.dim(), x.dim()));
        }
        if y.dim() != y0.dim() {
            return Err(shape_mismatch(index, y0.dim(), y.dim()));
        }
    }

    let xs = pairs.iter().map(|(x, _)| x.view()).collect::<Vec<_>>();
    let ys = pairs.iter().map(|(_, y)| y.view()).collect::<Vec<_>>();
    let signals =
        ndarray::stack(Axis(2), &xs).map_err(|e| BatchError::Internal(e.to_string()))?;
    let labels =
        ndarray::stack(Axis(2), &ys).map_err(|e| BatchError::Internal(e.to_string()))?;

    Ok(MaterializedBatch { signals, labels })
}

fn shape_mismatch(index: usize, expected: (usize, usize), found: (usize, usize)) -> BatchError {
    BatchError::ShapeMismatch {
        index,
        expected: vec![expected.0, expected.1],
        found: vec![found.0, found.1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{RoundingMode, TimeSpan};
    use crate::select::ChannelSelector;
    use ndarray::Array2;

    /// Produces rows whose value encodes `(channel, frame)`, one frame per
    /// millisecond for signals and one per second for labels.
    struct GridSource;

    #[async_trait]
    impl Materializer for GridSource {
        async fn load_item_samples(
            &self,
            item: &BatchItem,
        ) -> Result<(Samples, Samples), BatchError> {
            let names = match &item.channels {
                ChannelSelector::Named { channels } => channels.clone(),
                other => return Err(BatchError::invalid(format!("unsupported: {other:?}"))),
            };
            let (_, frames) = item.span.sample_range(item.sample_rate, item.rounding)?;
            let data = Array2::from_shape_fn((names.len(), frames as usize), |(c, t)| {
                c as f32 * 1000.0 + t as f32
            });
            let samples = Samples::new(names, data, item.sample_rate)?;

            let (_, label_frames) = item
                .label_span
                .sample_range(item.label_rate, item.rounding)?;
            let labels = Samples::new(
                vec!["label".into()],
                Array2::from_elem((1, label_frames as usize), 0.5),
                item.label_rate,
            )?;
            Ok((samples, labels))
        }
    }

    fn item(duration_ms: u64, channels: &[&str]) -> BatchItem {
        let span = TimeSpan::new(0, duration_ms).unwrap();
        BatchItem {
            source: "rec-0".into(),
            span,
            label_span: span,
            channels: ChannelSelector::named(channels.iter().copied()),
            sample_rate: 1000.0,
            label_rate: 1.0,
            rounding: RoundingMode::Exact,
        }
    }

    #[tokio::test]
    async fn test_batch_stacks_on_trailing_axis() {
        let batch = vec![item(2000, &["a", "b"]), item(2000, &["a", "b"])];
        let produced = materialize_batch(&GridSource, &batch).await.unwrap();

        assert_eq!(produced.signals.dim(), (2, 2000, 2));
        assert_eq!(produced.labels.dim(), (1, 2, 2));
        assert_eq!(produced.batch_size(), 2);
        // item 0, channel 1, frame 3
        assert_eq!(produced.signals[[1, 3, 0]], 1003.0);
    }

    #[tokio::test]
    async fn test_mismatched_item_shapes_fail() {
        let batch = vec![item(2000, &["a", "b"]), item(2000, &["a"])];
        let err = materialize_batch(&GridSource, &batch).await.unwrap_err();
        match err {
            BatchError::ShapeMismatch {
                index,
                expected,
                found,
            } => {
                assert_eq!(index, 1);
                assert_eq!(expected, vec![2, 2000]);
                assert_eq!(found, vec![1, 2000]);
            }
            other => panic!("Expected shape mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let err = materialize_batch(&GridSource, &vec![]).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }
}
