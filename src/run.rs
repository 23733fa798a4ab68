//! The batching loops: sequential specification, parallel materialization,
//! in-order delivery.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BatchError;
use crate::iterator::BatchIterator;
use crate::materialize::{materialize_batch, MaterializedBatch, Materializer};
use crate::pool::WorkerPool;
use crate::retry::{self, RetryConfig};
use crate::state::IterationState;
use crate::worker::{PendingBatch, WorkerHandle};

/// One element of the output stream.
///
/// `prev` is the state that reproduces this element and the consumer's
/// synchronization anchor; the payload carries the state after it. The
/// terminal sentinel is a `None` payload still anchored to its `prev`.
#[derive(Clone, Debug)]
pub struct BatchMessage<S> {
    pub payload: Option<(MaterializedBatch, S)>,
    pub prev: S,
}

/// How a batching loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The iterator was exhausted and the sentinel delivered.
    Done,
    /// The output channel was closed from outside.
    Closed,
}

/// Drive the iterator and materializer on the current task.
///
/// Used when the worker pool is empty. Materialization failures close the
/// output channel and propagate; a closed output channel is a normal exit.
pub(crate) async fn run_single<I>(
    iterator: Arc<I>,
    materializer: Arc<dyn Materializer>,
    retry: RetryConfig,
    state: I::State,
    out: mpsc::Sender<BatchMessage<I::State>>,
) -> Result<RunOutcome, BatchError>
where
    I: BatchIterator,
{
    let mut state = state;
    loop {
        let prev = state.clone();
        let Some((batch, next)) = iterator.next_batch(state) else {
            return match out.send(BatchMessage { payload: None, prev }).await {
                Ok(()) => Ok(RunOutcome::Done),
                Err(_) => Ok(RunOutcome::Closed),
            };
        };

        let produced =
            match retry::retry(&retry, || materialize_batch(materializer.as_ref(), &batch)).await
            {
                Ok(produced) => produced,
                Err(err) if err.is_closed() => return Ok(RunOutcome::Closed),
                Err(err) => return Err(err),
            };

        let message = BatchMessage {
            payload: Some((produced, next.clone())),
            prev,
        };
        if out.send(message).await.is_err() {
            return Ok(RunOutcome::Closed);
        }
        state = next;
    }
}

enum Job<S> {
    /// A dispatched materialization, in iteration order.
    Pending {
        worker: WorkerHandle,
        pending: PendingBatch,
        next: S,
        prev: S,
    },
    /// Iterator exhausted; `prev` anchors the sentinel.
    Finished { prev: S },
}

/// Distribute materialization across the pool, delivering in order.
///
/// The feeder advances the iterator sequentially and dispatches each batch
/// to a pool worker, queueing jobs in iteration order; the consumer awaits
/// each job FIFO and forwards results, so delivery order never depends on
/// completion order. A sentinel watches for external closure of the output
/// channel and cancels both. On every exit path the pool is reset so
/// in-flight workers return.
pub(crate) async fn run_multi<I>(
    iterator: Arc<I>,
    pool: WorkerPool,
    state: I::State,
    out: mpsc::Sender<BatchMessage<I::State>>,
) -> Result<RunOutcome, BatchError>
where
    I: BatchIterator,
{
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let sentinel = {
        let out = out.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = out.closed() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        })
    };

    let feeder = feed_jobs(iterator, pool.clone(), state, jobs_tx, cancel.clone());
    let consumer = drain_jobs(jobs_rx, pool.clone(), out, cancel.clone());
    let ((), result) = tokio::join!(feeder, consumer);

    cancel.cancel();
    let _ = sentinel.await;
    // bring in-flight workers home before reporting the outcome
    let _ = pool.reset().await;
    debug!(outcome = ?result.as_ref().ok(), "multi-worker loop finished");
    result
}

async fn feed_jobs<I>(
    iterator: Arc<I>,
    pool: WorkerPool,
    state: I::State,
    jobs: mpsc::UnboundedSender<Job<I::State>>,
    cancel: CancellationToken,
) where
    I: BatchIterator,
{
    let mut state = state;
    loop {
        let prev = state.clone();
        let Some((batch, next)) = iterator.next_batch(state) else {
            let _ = jobs.send(Job::Finished { prev });
            return;
        };

        // Nudge: wait for availability before committing to a take, and
        // re-check that the consumer still wants jobs.
        tokio::select! {
            _ = cancel.cancelled() => return,
            waited = pool.wait() => {
                if waited.is_err() {
                    return;
                }
            }
        }
        if jobs.is_closed() {
            return;
        }

        let worker = tokio::select! {
            _ = cancel.cancelled() => return,
            taken = pool.take() => match taken {
                Ok(worker) => worker,
                Err(_) => return,
            }
        };

        let pending = worker.materialize(batch);
        let job = Job::Pending {
            worker: worker.clone(),
            pending,
            next: next.clone(),
            prev,
        };
        if jobs.send(job).is_err() {
            // consumer is gone; the dispatched result will be discarded
            let _ = pool.put(worker);
            return;
        }
        state = next;
    }
}

async fn drain_jobs<S>(
    mut jobs: mpsc::UnboundedReceiver<Job<S>>,
    pool: WorkerPool,
    out: mpsc::Sender<BatchMessage<S>>,
    cancel: CancellationToken,
) -> Result<RunOutcome, BatchError>
where
    S: IterationState,
{
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Finished { prev } => {
                return match out.send(BatchMessage { payload: None, prev }).await {
                    Ok(()) => Ok(RunOutcome::Done),
                    Err(_) => Ok(RunOutcome::Closed),
                };
            }
            Job::Pending {
                worker,
                pending,
                next,
                prev,
            } => match pending.wait().await {
                Ok(produced) => {
                    let _ = pool.put(worker);
                    let message = BatchMessage {
                        payload: Some((produced, next)),
                        prev,
                    };
                    if out.send(message).await.is_err() {
                        cancel.cancel();
                        return Ok(RunOutcome::Closed);
                    }
                }
                Err(err) => {
                    cancel.cancel();
                    jobs.close();
                    if worker.is_alive() {
                        let _ = pool.put(worker);
                    }
                    return Err(err);
                }
            },
        }
    }
    // feeder bailed out without a terminal job
    Ok(RunOutcome::Closed)
}
