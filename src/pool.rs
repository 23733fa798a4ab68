//! The worker pool: an ordered, reentrant holder of worker identities.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::BatchError;
use crate::worker::WorkerHandle;

enum PoolCommand {
    Take(oneshot::Sender<WorkerHandle>),
    Put(WorkerHandle),
    Wait(oneshot::Sender<()>),
    Len(oneshot::Sender<usize>),
    Available(oneshot::Sender<usize>),
    Reset(oneshot::Sender<usize>),
}

/// Ordered multi-producer/multi-consumer pool of worker handles.
///
/// Membership lives in a single owner task; clones of the pool marshal
/// every operation to it over a command channel, so a handle can travel to
/// any task and stay coherent. Only the owner mutates membership.
///
/// Every operation fails `ChannelClosed` once the owner task is gone.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl WorkerPool {
    /// Start a pool owning the given workers, available in id order.
    pub fn new(workers: Vec<WorkerHandle>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_pool(rx, workers));
        Self { commands: tx }
    }

    fn send(&self, command: PoolCommand) -> Result<(), BatchError> {
        self.commands
            .send(command)
            .map_err(|_| BatchError::ChannelClosed)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T, BatchError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| BatchError::ChannelClosed)
    }

    /// Check a worker out, blocking while none is available.
    pub async fn take(&self) -> Result<WorkerHandle, BatchError> {
        self.ask(PoolCommand::Take).await
    }

    /// Return a worker. Non-blocking; a worker already queued is left
    /// alone, and an unknown worker is adopted into membership.
    pub fn put(&self, worker: WorkerHandle) -> Result<(), BatchError> {
        self.send(PoolCommand::Put(worker))
    }

    /// Block until at least one worker is available, consuming nothing.
    ///
    /// A nudge, not a reservation: another caller may still take the
    /// worker first.
    pub async fn wait(&self) -> Result<(), BatchError> {
        self.ask(PoolCommand::Wait).await
    }

    /// Total managed workers, including checked-out ones.
    pub async fn len(&self) -> Result<usize, BatchError> {
        self.ask(PoolCommand::Len).await
    }

    /// Workers currently waiting in the queue.
    pub async fn available(&self) -> Result<usize, BatchError> {
        self.ask(PoolCommand::Available).await
    }

    /// Probe membership, drop dead workers, and requeue every live one
    /// exactly once, in id order. Returns the surviving member count.
    ///
    /// Idempotent; checked-out workers are considered returned.
    pub async fn reset(&self) -> Result<usize, BatchError> {
        self.ask(PoolCommand::Reset).await
    }
}

struct PoolState {
    managed: Vec<WorkerHandle>,
    available: VecDeque<WorkerHandle>,
    takers: VecDeque<oneshot::Sender<WorkerHandle>>,
    watchers: Vec<oneshot::Sender<()>>,
}

impl PoolState {
    fn new(mut workers: Vec<WorkerHandle>) -> Self {
        workers.sort_by_key(|w| w.id());
        workers.dedup_by_key(|w| w.id());
        Self {
            available: workers.iter().cloned().collect(),
            managed: workers,
            takers: VecDeque::new(),
            watchers: Vec::new(),
        }
    }

    fn put(&mut self, worker: WorkerHandle) {
        if !self.managed.iter().any(|w| w.id() == worker.id()) {
            let at = self
                .managed
                .partition_point(|w| w.id() < worker.id());
            self.managed.insert(at, worker.clone());
        }
        if self.available.iter().any(|w| w.id() == worker.id()) {
            return;
        }
        self.offer(worker);
    }

    /// Hand a worker to the first waiting taker, or queue it.
    fn offer(&mut self, worker: WorkerHandle) {
        let mut worker = worker;
        while let Some(taker) = self.takers.pop_front() {
            match taker.send(worker) {
                Ok(()) => return,
                // taker hung up; keep the worker for the next one
                Err(returned) => worker = returned,
            }
        }
        self.available.push_back(worker);
        self.notify_watchers();
    }

    fn notify_watchers(&mut self) {
        for watcher in self.watchers.drain(..) {
            let _ = watcher.send(());
        }
    }

    fn reset(&mut self) -> usize {
        self.available.clear();
        self.managed.retain(|w| w.is_alive());
        let requeue = self.managed.clone();
        for worker in requeue {
            self.offer(worker);
        }
        self.managed.len()
    }
}

async fn run_pool(mut commands: mpsc::UnboundedReceiver<PoolCommand>, workers: Vec<WorkerHandle>) {
    let mut state = PoolState::new(workers);
    debug!(workers = state.managed.len(), "worker pool started");

    while let Some(command) = commands.recv().await {
        match command {
            PoolCommand::Take(reply) => match state.available.pop_front() {
                Some(worker) => {
                    if let Err(worker) = reply.send(worker) {
                        // taker vanished between send and receive
                        state.available.push_front(worker);
                    }
                }
                None => state.takers.push_back(reply),
            },
            PoolCommand::Put(worker) => state.put(worker),
            PoolCommand::Wait(reply) => {
                if state.available.is_empty() {
                    state.watchers.push(reply);
                } else {
                    let _ = reply.send(());
                }
            }
            PoolCommand::Len(reply) => {
                let _ = reply.send(state.managed.len());
            }
            PoolCommand::Available(reply) => {
                let _ = reply.send(state.available.len());
            }
            PoolCommand::Reset(reply) => {
                let live = state.reset();
                let _ = reply.send(live);
            }
        }
    }
}
