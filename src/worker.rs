//! Worker tasks: out-of-band executors for materialization jobs.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::BatchError;
use crate::item::Batch;
use crate::materialize::{materialize_batch, MaterializedBatch, Materializer};
use crate::retry::{self, RetryConfig};

/// Identity of a worker within a pool.
pub type WorkerId = usize;

struct JobRequest {
    batch: Batch,
    reply: oneshot::Sender<Result<MaterializedBatch, BatchError>>,
}

/// Handle to a spawned worker.
///
/// Cloneable and sendable anywhere; jobs are queued to the worker task and
/// answered FIFO. Every failure the worker produces is wrapped with its id.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    jobs: mpsc::UnboundedSender<JobRequest>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the worker task is still accepting jobs.
    pub fn is_alive(&self) -> bool {
        !self.jobs.is_closed()
    }

    /// Dispatch a batch to the worker.
    ///
    /// Returns immediately; the job runs on the worker task and the result
    /// is claimed through the returned [`PendingBatch`].
    pub fn materialize(&self, batch: Batch) -> PendingBatch {
        let (tx, rx) = oneshot::channel();
        let reply = match self.jobs.send(JobRequest { batch, reply: tx }) {
            Ok(()) => Some(rx),
            Err(_) => None,
        };
        PendingBatch {
            worker: self.id,
            reply,
        }
    }
}

/// One-shot future for a dispatched materialization job.
pub struct PendingBatch {
    worker: WorkerId,
    reply: Option<oneshot::Receiver<Result<MaterializedBatch, BatchError>>>,
}

impl PendingBatch {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Await the worker's answer.
    ///
    /// A worker that died before answering resolves to
    /// `Remote(WorkerLost)`; the job itself is not re-run.
    pub async fn wait(self) -> Result<MaterializedBatch, BatchError> {
        let worker = self.worker;
        let lost = move || BatchError::remote(worker, BatchError::WorkerLost { worker });
        match self.reply {
            None => Err(lost()),
            Some(rx) => rx.await.map_err(|_| lost())?,
        }
    }
}

/// Spawn a worker task around a materializer.
///
/// The handle is what pools hold; the join handle is for supervision and
/// teardown. Dropping every handle ends the task after its queue drains.
pub fn spawn_worker(
    id: WorkerId,
    materializer: Arc<dyn Materializer>,
    retry: RetryConfig,
) -> (WorkerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<JobRequest>();

    let task = tokio::spawn(async move {
        while let Some(JobRequest { batch, reply }) = rx.recv().await {
            let result = retry::retry(&retry, || materialize_batch(materializer.as_ref(), &batch))
                .await
                .map_err(|e| BatchError::remote(id, e));
            // receiver may have given up; the result is simply dropped
            let _ = reply.send(result);
        }
        debug!(worker = id, "worker task exiting");
    });

    (WorkerHandle { id, jobs: tx }, task)
}
