//! Batchline
//!
//! An ordered, resumable, back-pressured batching pipeline: a lazy stream
//! of cheap *batch specifications* is materialized into dense training
//! tensors, with the expensive I/O and decoding spread across a pool of
//! workers while delivery stays in iteration order.
//!
//! The service is deterministic end to end: iteration is a pure function
//! of a cloneable state value, so the same starting state always yields
//! the same batches, no matter how many workers run or how their futures
//! interleave. Consumers drive the stream with [`Batcher::take`], passing
//! the state they believe comes next; the service resynchronizes whenever
//! the two disagree.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use batchline::{
//!     spawn_worker, Batcher, LocalFileReader, LpcmStore, RandomBatches, Recording,
//!     RetryConfig, SeedState, WorkerPool,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let recordings = vec![Recording {
//!         id: "rec-0".into(),
//!         duration_ms: 3_600_000,
//!         channels: vec!["c3".into(), "c4".into()],
//!         sample_rate: 128.0,
//!         label_rate: 1.0,
//!     }];
//!     let sampler = RandomBatches::new(recordings, 2, 300_000)?;
//!
//!     let store = || LpcmStore::new(Arc::new(LocalFileReader), HashMap::new());
//!     let workers = (0..3usize)
//!         .map(|id| spawn_worker(id, Arc::new(store()), RetryConfig::default()).0)
//!         .collect::<Vec<_>>();
//!     let mut batcher = Batcher::builder(sampler, store())
//!         .workers(WorkerPool::new(workers))
//!         .build();
//!
//!     let mut state = SeedState::new(1338);
//!     while let Some((batch, next)) = batcher.take(state).await? {
//!         println!("X {:?}  Y {:?}", batch.signals.dim(), batch.labels.dim());
//!         state = next;
//!     }
//!     Ok(())
//! }
//! ```

mod batcher;
mod error;
mod iterator;
mod item;
mod materialize;
mod pool;
mod retry;
mod run;
mod select;
mod state;
mod storage;
#[cfg(test)]
mod testing;
mod worker;

pub use batcher::{Batcher, BatcherBuilder, BatcherStatus};
pub use error::BatchError;
pub use iterator::{BatchIterator, RandomBatches, Recording};
pub use item::{Batch, BatchItem, RoundingMode, SourceId, TimeSpan};
pub use materialize::{materialize_batch, materialize_item, MaterializedBatch, Materializer};
pub use pool::WorkerPool;
pub use retry::{retry, JitterMode, RetryConfig};
pub use run::{BatchMessage, RunOutcome};
pub use select::{ChannelSelector, Samples};
pub use state::{IterationState, SeedState};
pub use storage::{
    decode_lpcm, ByteRangeReader, LocalFileReader, LpcmEntry, LpcmInfo, LpcmStore, MemoryReader,
    SampleType,
};
pub use worker::{spawn_worker, PendingBatch, WorkerHandle, WorkerId};
