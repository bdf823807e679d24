use std::future::Future;
use std::sync::Arc;
use log::{debug, error};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Result of driving one job list through the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Jobs whose completion callback ran
    pub completed: usize,
    /// Jobs dropped before starting because the pool was cancelled
    pub abandoned: usize,
}

/// Runs jobs with at most `capacity` operations in flight.
///
/// Every job is spawned up front and waits for a semaphore permit before the
/// operation starts. The permit is owned by the task, so it is released on
/// every exit path. `run` returns only after all spawned tasks finished.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    capacity: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Jobs still waiting for a permit are abandoned once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn run<J, O, Op, Fut, C>(&self, jobs: Vec<J>, operation: Op, on_complete: C) -> PoolReport
    where
        J: Clone + Send + 'static,
        O: Send + 'static,
        Op: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        C: Fn(J, O) + Send + Sync + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.capacity));
        let operation = Arc::new(operation);
        let on_complete = Arc::new(on_complete);
        let mut tasks = JoinSet::new();

        debug!("Worker pool starting {} job(s) with capacity {}", jobs.len(), self.capacity);

        for job in jobs {
            let semaphore = Arc::clone(&semaphore);
            let operation = Arc::clone(&operation);
            let on_complete = Arc::clone(&on_complete);
            let cancel = self.cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return false,
                    },
                };
                if cancel.is_cancelled() {
                    return false;
                }

                let outcome = operation(job.clone()).await;
                on_complete(job, outcome);
                true
            });
        }

        let mut report = PoolReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => report.completed += 1,
                Ok(false) => report.abandoned += 1,
                Err(e) => {
                    error!("Worker task failed: {}", e);
                    report.abandoned += 1;
                }
            }
        }

        debug!(
            "Worker pool finished: {} completed, {} abandoned",
            report.completed, report.abandoned
        );
        report
    }
}
