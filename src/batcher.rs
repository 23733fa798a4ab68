//! The service façade: lifecycle, synchronization, and consumption.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::error::BatchError;
use crate::iterator::BatchIterator;
use crate::materialize::{MaterializedBatch, Materializer};
use crate::pool::WorkerPool;
use crate::retry::RetryConfig;
use crate::run::{run_multi, run_single, BatchMessage, RunOutcome};

/// How long `stop` waits for the batching loop after closing the channel.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle status of a [`Batcher`].
///
/// Terminal statuses are sticky: once the running loop settles, every
/// `status` call reports the same value until the next `start`.
#[derive(Clone, Debug)]
pub enum BatcherStatus {
    /// Never started, or restarted and not yet running.
    Stopped,
    /// The batching loop is live.
    Running,
    /// The output channel was closed before the iterator finished.
    Closed,
    /// The iterator was exhausted and the sentinel delivered.
    Done,
    /// `stop` timed out waiting for the batching loop.
    Unknown,
    /// The loop failed; the error is returned, not raised, here.
    Failed(BatchError),
}

impl BatcherStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, BatcherStatus::Running)
    }

    /// The failure, if the service has one.
    pub fn error(&self) -> Option<&BatchError> {
        match self {
            BatcherStatus::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Ordered, resumable batch service.
///
/// Runs the batching loop on a background task — multi-worker when the pool
/// has members, local otherwise — and delivers batches in iteration order
/// through [`take`](Batcher::take), resynchronizing whenever the caller's
/// state disagrees with the stream.
///
/// # Example
///
/// ```ignore
/// let mut batcher = Batcher::builder(sampler, store).workers(pool).build();
/// let mut state = SeedState::new(1338);
/// while let Some((batch, next)) = batcher.take(state).await? {
///     train_on(batch);
///     state = next;
/// }
/// ```
pub struct Batcher<I: BatchIterator> {
    iterator: Arc<I>,
    materializer: Arc<dyn Materializer>,
    pool: WorkerPool,
    retry: RetryConfig,
    buffer: Option<usize>,
    out: Option<mpsc::Receiver<BatchMessage<I::State>>>,
    running: Option<JoinHandle<Result<RunOutcome, BatchError>>>,
    terminal: Option<BatcherStatus>,
}

impl<I: BatchIterator> Batcher<I> {
    pub fn builder(iterator: I, materializer: impl Materializer) -> BatcherBuilder<I> {
        BatcherBuilder {
            iterator,
            materializer: Arc::new(materializer),
            pool: None,
            retry: RetryConfig::default(),
            buffer: None,
        }
    }

    /// The worker pool backing this service.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Begin producing from `state`.
    ///
    /// Ignored with a warning while a loop is already live; a stopped,
    /// finished, or failed service starts fresh, replacing the output
    /// channel (the previous one may be closed beyond recovery).
    pub async fn start(&mut self, state: I::State) {
        if self.is_live() {
            warn!("batcher already running; ignoring start");
            return;
        }

        let workers = self.pool.len().await.unwrap_or(0);
        let capacity = self.buffer.unwrap_or(2 * workers + 1).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        self.out = Some(rx);
        self.terminal = None;

        let handle = if workers == 0 {
            let iterator = Arc::clone(&self.iterator);
            let materializer = Arc::clone(&self.materializer);
            let retry = self.retry.clone();
            tokio::spawn(run_single(iterator, materializer, retry, state, tx))
        } else {
            let iterator = Arc::clone(&self.iterator);
            let pool = self.pool.clone();
            tokio::spawn(run_multi(iterator, pool, state, tx))
        };
        self.running = Some(handle);
        debug!(workers, capacity, "batcher started");
    }

    /// Close the output channel and wait for the loop to settle.
    ///
    /// Safe to call in any state and any number of times; never raises.
    pub async fn stop(&mut self) {
        if let Some(out) = self.out.as_mut() {
            out.close();
        }
        if let Some(handle) = self.running.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(joined) => self.terminal = Some(settle(joined)),
                Err(_) => {
                    warn!("batching loop did not settle within {STOP_TIMEOUT:?}");
                    self.terminal = Some(BatcherStatus::Unknown);
                }
            }
        }
        self.out = None;
    }

    /// Non-blocking status peek. Errors are returned, never raised.
    pub async fn status(&mut self) -> BatcherStatus {
        if let Some(status) = &self.terminal {
            return status.clone();
        }
        let finished = match &self.running {
            None => return BatcherStatus::Stopped,
            Some(handle) => handle.is_finished(),
        };
        if !finished {
            return BatcherStatus::Running;
        }
        // the loop has settled; harvesting the handle cannot block
        let status = match self.running.take() {
            Some(handle) => settle(handle.await),
            None => BatcherStatus::Stopped,
        };
        self.terminal = Some(status.clone());
        status
    }

    /// Fetch the batch produced from `state`.
    ///
    /// Returns `Ok(None)` once the iterator is exhausted. When the head of
    /// the stream was produced from a different state, the service is
    /// stopped and restarted from `state`, so callers may rewind or
    /// fast-forward at will. A failed service raises its error before the
    /// channel is consulted.
    pub async fn take(
        &mut self,
        state: I::State,
    ) -> Result<Option<(MaterializedBatch, I::State)>, BatchError> {
        loop {
            if let BatcherStatus::Failed(err) = self.status().await {
                return Err(err);
            }
            if self.out.is_none() {
                self.start(state.clone()).await;
            }
            let Some(out) = self.out.as_mut() else {
                return Err(BatchError::Internal("no output channel after start".into()));
            };

            match out.recv().await {
                Some(message) if message.prev == state => {
                    return Ok(message.payload);
                }
                Some(_) => {
                    warn!("iteration state drift detected; resynchronizing");
                    self.stop().await;
                    self.start(state.clone()).await;
                }
                None => {
                    // producers are gone: settle the loop, surface a
                    // failure, otherwise restart from the caller's state
                    self.stop().await;
                    if let BatcherStatus::Failed(err) = self.status().await {
                        return Err(err);
                    }
                    self.start(state.clone()).await;
                }
            }
        }
    }

    fn is_live(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

fn settle(joined: Result<Result<RunOutcome, BatchError>, JoinError>) -> BatcherStatus {
    match joined {
        Ok(Ok(RunOutcome::Done)) => BatcherStatus::Done,
        Ok(Ok(RunOutcome::Closed)) => BatcherStatus::Closed,
        Ok(Err(err)) => BatcherStatus::Failed(err),
        Err(join_err) => BatcherStatus::Failed(BatchError::Internal(join_err.to_string())),
    }
}

/// Builder for configuring a [`Batcher`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct BatcherBuilder<I: BatchIterator> {
    iterator: I,
    materializer: Arc<dyn Materializer>,
    pool: Option<WorkerPool>,
    retry: RetryConfig,
    buffer: Option<usize>,
}

impl<I: BatchIterator> BatcherBuilder<I> {
    /// Attach a worker pool; without one, batches materialize on the
    /// manager task.
    pub fn workers(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Output channel capacity. Defaults to `2 * pool size + 1`.
    pub fn buffer(mut self, capacity: usize) -> Self {
        self.buffer = Some(capacity);
        self
    }

    /// Retry policy applied around materialization.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Batcher<I> {
        Batcher {
            iterator: Arc::new(self.iterator),
            materializer: self.materializer,
            pool: self.pool.unwrap_or_else(|| WorkerPool::new(Vec::new())),
            retry: self.retry,
            buffer: self.buffer,
            out: None,
            running: None,
            terminal: None,
        }
    }
}
