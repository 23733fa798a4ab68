//! Byte-range storage backends and the LPCM on-disk sample format.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ndarray::Array2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::BatchError;
use crate::item::{BatchItem, RoundingMode, SourceId, TimeSpan};
use crate::materialize::Materializer;
use crate::select::Samples;

/// Ranged access to persisted objects.
///
/// `read` must fail `OutOfRange` when `offset + count` exceeds the object,
/// never truncate.
#[async_trait]
pub trait ByteRangeReader: Send + Sync + 'static {
    /// Read `count` bytes starting at `offset`.
    async fn read(&self, path: &str, offset: u64, count: u64) -> Result<Bytes, BatchError>;

    /// Total object size in bytes.
    async fn len(&self, path: &str) -> Result<u64, BatchError>;
}

/// Reads ranges out of local files.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFileReader;

#[async_trait]
impl ByteRangeReader for LocalFileReader {
    async fn read(&self, path: &str, offset: u64, count: u64) -> Result<Bytes, BatchError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BatchError::from_io(path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| BatchError::from_io(path, e))?
            .len();
        check_range(path, offset, count, size)?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| BatchError::from_io(path, e))?;
        let mut buf = vec![0u8; count as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| BatchError::from_io(path, e))?;
        Ok(buf.into())
    }

    async fn len(&self, path: &str) -> Result<u64, BatchError> {
        Ok(tokio::fs::metadata(path)
            .await
            .map_err(|e| BatchError::from_io(path, e))?
            .len())
    }
}

/// In-memory object registry for fixtures and tests.
#[derive(Debug, Default)]
pub struct MemoryReader {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an object.
    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Bytes>) {
        self.objects.write().insert(path.into(), bytes.into());
    }

    fn get(&self, path: &str) -> Result<Bytes, BatchError> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| BatchError::Open {
                path: path.to_string(),
                message: "no such object".into(),
            })
    }
}

#[async_trait]
impl ByteRangeReader for MemoryReader {
    async fn read(&self, path: &str, offset: u64, count: u64) -> Result<Bytes, BatchError> {
        let object = self.get(path)?;
        check_range(path, offset, count, object.len() as u64)?;
        Ok(object.slice(offset as usize..(offset + count) as usize))
    }

    async fn len(&self, path: &str) -> Result<u64, BatchError> {
        Ok(self.get(path)?.len() as u64)
    }
}

fn check_range(path: &str, offset: u64, count: u64, size: u64) -> Result<(), BatchError> {
    if offset.checked_add(count).map_or(true, |end| end > size) {
        return Err(BatchError::OutOfRange {
            path: path.to_string(),
            offset,
            count,
            size,
        });
    }
    Ok(())
}

/// Persisted sample encoding of an LPCM object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    F32,
    I16,
    I32,
}

impl SampleType {
    pub fn byte_width(&self) -> usize {
        match self {
            SampleType::F32 | SampleType::I32 => 4,
            SampleType::I16 => 2,
        }
    }
}

/// Sidecar metadata describing an LPCM-encoded object.
///
/// Frames are channel-interleaved, little-endian, starting
/// `start_offset_ms` into the recording's own timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LpcmInfo {
    pub sample_rate: f64,
    pub channels: Vec<String>,
    pub sample_type: SampleType,
    #[serde(default)]
    pub start_offset_ms: u64,
}

impl LpcmInfo {
    pub fn frame_bytes(&self) -> u64 {
        (self.channels.len() * self.sample_type.byte_width()) as u64
    }

    /// Byte range covering `span`, relative to the start of this object.
    pub fn byte_range(
        &self,
        span: &TimeSpan,
        mode: RoundingMode,
    ) -> Result<(u64, u64), BatchError> {
        if span.start_ms < self.start_offset_ms {
            return Err(BatchError::invalid(format!(
                "span starts at {} ms but the object begins at {} ms",
                span.start_ms, self.start_offset_ms
            )));
        }
        let local = TimeSpan {
            start_ms: span.start_ms - self.start_offset_ms,
            end_ms: span.end_ms - self.start_offset_ms,
        };
        let (first, count) = local.sample_range(self.sample_rate, mode)?;
        Ok((first * self.frame_bytes(), count * self.frame_bytes()))
    }
}

/// Decode an LPCM byte run into `(channels, frames)` rows.
pub fn decode_lpcm(bytes: &[u8], info: &LpcmInfo) -> Result<Array2<f32>, BatchError> {
    let frame_bytes = info.frame_bytes() as usize;
    if frame_bytes == 0 {
        return Err(BatchError::invalid("LPCM object with no channels"));
    }
    if bytes.len() % frame_bytes != 0 {
        return Err(BatchError::invalid(format!(
            "{} bytes do not divide into {}-byte frames",
            bytes.len(),
            frame_bytes
        )));
    }

    let n_channels = info.channels.len();
    let frames = bytes.len() / frame_bytes;
    let width = info.sample_type.byte_width();
    let sample_type = info.sample_type;

    let data = Array2::from_shape_fn((n_channels, frames), |(c, t)| {
        let at = (t * n_channels + c) * width;
        match sample_type {
            SampleType::F32 => {
                f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
            }
            SampleType::I16 => i16::from_le_bytes([bytes[at], bytes[at + 1]]) as f32,
            SampleType::I32 => {
                i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as f32
            }
        }
    });
    Ok(data)
}

/// Catalog entry binding one source id to its persisted signal and labels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LpcmEntry {
    pub signal_path: String,
    pub signal: LpcmInfo,
    pub label_path: String,
    pub labels: LpcmInfo,
}

/// A [`Materializer`] over LPCM objects resolved through a byte-range
/// reader.
///
/// The item's spans are translated to byte ranges against each object's own
/// timeline, fetched with ranged reads, and decoded; windows outside the
/// persisted object surface the reader's `OutOfRange`.
pub struct LpcmStore {
    reader: Arc<dyn ByteRangeReader>,
    catalog: HashMap<SourceId, LpcmEntry>,
}

impl LpcmStore {
    pub fn new(reader: Arc<dyn ByteRangeReader>, catalog: HashMap<SourceId, LpcmEntry>) -> Self {
        Self { reader, catalog }
    }

    async fn fetch(
        &self,
        path: &str,
        info: &LpcmInfo,
        span: &TimeSpan,
        mode: RoundingMode,
    ) -> Result<Samples, BatchError> {
        let (offset, count) = info.byte_range(span, mode)?;
        let bytes = self.reader.read(path, offset, count).await?;
        let data = decode_lpcm(&bytes, info)?;
        Samples::new(info.channels.clone(), data, info.sample_rate)
    }
}

#[async_trait]
impl Materializer for LpcmStore {
    async fn load_item_samples(
        &self,
        item: &BatchItem,
    ) -> Result<(Samples, Samples), BatchError> {
        let entry = self.catalog.get(&item.source).ok_or_else(|| BatchError::Open {
            path: item.source.clone(),
            message: "source not in catalog".into(),
        })?;

        let samples = self
            .fetch(&entry.signal_path, &entry.signal, &item.span, item.rounding)
            .await?;
        let labels = self
            .fetch(
                &entry.label_path,
                &entry.labels,
                &item.label_span,
                item.rounding,
            )
            .await?;
        Ok((samples, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::materialize_batch;
    use crate::select::ChannelSelector;

    fn encode_f32(frames: &[Vec<f32>]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            for sample in frame {
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
        out
    }

    fn two_channel_info(rate: f64) -> LpcmInfo {
        LpcmInfo {
            sample_rate: rate,
            channels: vec!["c1".into(), "c2".into()],
            sample_type: SampleType::F32,
            start_offset_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_reader_rejects_out_of_range() {
        let reader = MemoryReader::new();
        reader.insert("obj", vec![0u8; 16]);

        assert_eq!(reader.read("obj", 8, 8).await.unwrap().len(), 8);
        match reader.read("obj", 8, 9).await.unwrap_err() {
            BatchError::OutOfRange { size, .. } => assert_eq!(size, 16),
            other => panic!("Expected out-of-range, got {other:?}"),
        }
        assert!(matches!(
            reader.read("ghost", 0, 1).await.unwrap_err(),
            BatchError::Open { .. }
        ));
    }

    #[tokio::test]
    async fn test_local_file_reader_ranges() {
        let path = std::env::temp_dir().join("batchline-range-test.lpcm");
        tokio::fs::write(&path, (0u8..32).collect::<Vec<_>>())
            .await
            .unwrap();
        let path = path.to_string_lossy().to_string();

        let bytes = LocalFileReader.read(&path, 4, 4).await.unwrap();
        assert_eq!(&bytes[..], &[4, 5, 6, 7]);
        assert!(matches!(
            LocalFileReader.read(&path, 30, 4).await.unwrap_err(),
            BatchError::OutOfRange { .. }
        ));
        assert!(matches!(
            LocalFileReader.read("not-a-path", 0, 1).await.unwrap_err(),
            BatchError::Open { .. }
        ));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[test]
    fn test_decode_lpcm_deinterleaves() {
        let info = two_channel_info(1000.0);
        let bytes = encode_f32(&[vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]]);
        let data = decode_lpcm(&bytes, &info).unwrap();
        assert_eq!(data, ndarray::array![[1.0, 2.0, 3.0], [10.0, 20.0, 30.0]]);
    }

    #[test]
    fn test_decode_lpcm_integer_types() {
        let info = LpcmInfo {
            sample_rate: 1.0,
            channels: vec!["c".into()],
            sample_type: SampleType::I16,
            start_offset_ms: 0,
        };
        let bytes = [(-5i16).to_le_bytes(), 7i16.to_le_bytes()].concat();
        let data = decode_lpcm(&bytes, &info).unwrap();
        assert_eq!(data, ndarray::array![[-5.0, 7.0]]);
    }

    #[test]
    fn test_decode_lpcm_rejects_torn_frames() {
        let info = two_channel_info(1000.0);
        assert!(decode_lpcm(&[0u8; 12], &info).is_err());
    }

    #[test]
    fn test_byte_range_honors_start_offset() {
        let mut info = two_channel_info(1000.0);
        info.start_offset_ms = 500;

        let span = TimeSpan::new(600, 700).unwrap();
        // 100 frames into the object, 100 frames long, 8 bytes per frame
        assert_eq!(
            info.byte_range(&span, RoundingMode::Exact).unwrap(),
            (800, 800)
        );

        let early = TimeSpan::new(400, 700).unwrap();
        assert!(info.byte_range(&early, RoundingMode::Exact).is_err());
    }

    #[tokio::test]
    async fn test_store_materializes_a_batch_end_to_end() {
        let reader = Arc::new(MemoryReader::new());

        // one second of two-channel signal at 1 kHz, labels at 1 Hz
        let signal_frames: Vec<Vec<f32>> =
            (0..1000).map(|t| vec![t as f32, -(t as f32)]).collect();
        reader.insert("rec-0.signal", encode_f32(&signal_frames));
        reader.insert("rec-0.labels", encode_f32(&[vec![1.0]]));

        let entry = LpcmEntry {
            signal_path: "rec-0.signal".into(),
            signal: two_channel_info(1000.0),
            label_path: "rec-0.labels".into(),
            labels: LpcmInfo {
                sample_rate: 1.0,
                channels: vec!["awake".into()],
                sample_type: SampleType::F32,
                start_offset_ms: 0,
            },
        };
        let store = LpcmStore::new(reader, HashMap::from([("rec-0".into(), entry)]));

        let span = TimeSpan::new(0, 1000).unwrap();
        let item = BatchItem {
            source: "rec-0".into(),
            span,
            label_span: span,
            channels: ChannelSelector::named(["c2"]),
            sample_rate: 1000.0,
            label_rate: 1.0,
            rounding: RoundingMode::Exact,
        };

        let produced = materialize_batch(&store, &vec![item.clone(), item])
            .await
            .unwrap();
        assert_eq!(produced.signals.dim(), (1, 1000, 2));
        assert_eq!(produced.labels.dim(), (1, 1, 2));
        assert_eq!(produced.signals[[0, 3, 1]], -3.0);
        assert_eq!(produced.labels[[0, 0, 0]], 1.0);
    }

    #[tokio::test]
    async fn test_store_window_past_object_is_out_of_range() {
        let reader = Arc::new(MemoryReader::new());
        reader.insert("short.signal", encode_f32(&vec![vec![0.0, 0.0]; 100]));
        reader.insert("short.labels", encode_f32(&[vec![0.0]]));

        let entry = LpcmEntry {
            signal_path: "short.signal".into(),
            signal: two_channel_info(1000.0),
            label_path: "short.labels".into(),
            labels: LpcmInfo {
                sample_rate: 1.0,
                channels: vec!["l".into()],
                sample_type: SampleType::F32,
                start_offset_ms: 0,
            },
        };
        let store = LpcmStore::new(reader, HashMap::from([("short".into(), entry)]));

        let item = BatchItem {
            source: "short".into(),
            span: TimeSpan::new(0, 200).unwrap(),
            label_span: TimeSpan::new(0, 1000).unwrap(),
            channels: ChannelSelector::named(["c1"]),
            sample_rate: 1000.0,
            label_rate: 1.0,
            rounding: RoundingMode::Exact,
        };
        assert!(matches!(
            store.load_item_samples(&item).await.unwrap_err(),
            BatchError::OutOfRange { .. }
        ));
    }
}
