//! Worker reactors.
//!
//! Each worker is one OS thread driving a current-thread Tokio runtime.
//! Sockets opened on a worker stay on it for their whole life, which is
//! what lets the pool keep one idle queue per worker.

use std::cell::Cell;
use std::future::Future;
use std::thread;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Identifier of a worker reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    /// The worker owning the calling thread, if any.
    pub fn current() -> Option<WorkerId> {
        CURRENT_WORKER.with(|w| w.get())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Error type for worker startup.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to build runtime for {worker}: {source}")]
    Runtime {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn thread for {worker}: {source}")]
    Thread {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },
}

struct Worker {
    id: WorkerId,
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// A fixed set of single-threaded reactors.
pub struct WorkerGroup {
    workers: Vec<Worker>,
}

impl WorkerGroup {
    /// Start `count` workers (at least one).
    pub fn start(count: usize) -> Result<Self, WorkerError> {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let id = WorkerId::new(index);
            let runtime = Builder::new_current_thread()
                .enable_all()
                .thread_name(format!("origin-{}", id))
                .build()
                .map_err(|source| WorkerError::Runtime { worker: id, source })?;
            let handle = runtime.handle().clone();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            let thread = thread::Builder::new()
                .name(format!("origin-{}", id))
                .spawn(move || {
                    CURRENT_WORKER.with(|w| w.set(Some(id)));
                    runtime.block_on(async move {
                        let _ = stop_rx.await;
                    });
                    tracing::debug!(worker = %id, "Worker stopped");
                })
                .map_err(|source| WorkerError::Thread { worker: id, source })?;

            workers.push(Worker {
                id,
                handle,
                stop: Some(stop_tx),
                thread: Some(thread),
            });
        }

        tracing::info!(workers = count, "Worker reactors started");
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.iter().map(|w| w.id)
    }

    /// Runtime handle of a worker.
    pub fn handle(&self, worker: WorkerId) -> Option<&Handle> {
        self.workers.get(worker.index()).map(|w| &w.handle)
    }

    /// Spawn a task on a specific worker.
    ///
    /// The task observes `WorkerId::current() == Some(worker)`.
    pub fn spawn_on<F>(&self, worker: WorkerId, fut: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle(worker).map(|h| h.spawn(fut))
    }

    /// Stop every worker and join its thread.
    pub fn shutdown(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        for worker in &mut self.workers {
            if let Some(stop) = worker.stop.take() {
                let _ = stop.send(());
            }
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    tracing::error!(worker = %worker.id, "Worker thread panicked");
                }
            }
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_on_their_worker() {
        let group = WorkerGroup::start(3).unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(WorkerId::current(), None);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            for id in group.ids().collect::<Vec<_>>() {
                let seen = group
                    .spawn_on(id, async { WorkerId::current() })
                    .unwrap()
                    .await
                    .unwrap();
                assert_eq!(seen, Some(id));
            }
        });

        assert!(group.spawn_on(WorkerId::new(7), async {}).is_none());
        group.shutdown();
    }

    #[test]
    fn test_zero_workers_rounds_up() {
        let group = WorkerGroup::start(0).unwrap();
        assert_eq!(group.len(), 1);
    }
}
