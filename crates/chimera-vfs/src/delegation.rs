//! Delegation worker pool: bounded offload of blocking backend work.
//!
//! `spec.md` describes a fixed-size thread pool that blocking backend
//! calls (e.g. a synchronous disk read in a backend without its own
//! async I/O) are handed off to, with FIFO order preserved per
//! submitting thread but no ordering guarantee across submitters.
//! `tokio::task::spawn_blocking` gated by a `Semaphore` is the
//! idiomatic equivalent of a bounded thread pool on top of the
//! runtime this workspace already depends on, rather than hand-rolling
//! OS thread management the way the source does.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

/// A unit of blocking work submitted to the pool.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by [`DelegationPool::submit`].
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("delegation pool is shutting down")]
    ShuttingDown,
}

/// Per-submitting-thread FIFO queue feeding the shared, semaphore-gated
/// blocking pool.
///
/// Each [`DelegationPool::queue_for_thread`] call hands back an
/// independent sender/consumer pair: work submitted through one queue
/// runs in submission order, but two queues race each other for the
/// shared semaphore permits with no ordering between them, matching
/// the specification's FIFO-within-submitter / unordered-across-
/// submitters guarantee.
pub struct DelegationQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl DelegationQueue {
    /// Submit a closure to run on a blocking-pool thread. Resolves once
    /// queued, not once run; use the returned oneshot-wrapped future
    /// from [`DelegationPool::submit`] to await the result instead when
    /// a return value is needed.
    pub fn submit(&self, job: Job) -> Result<(), DelegationError> {
        self.tx.send(job).map_err(|_| DelegationError::ShuttingDown)
    }
}

/// Bounded pool of blocking-work workers, shared across all VFS
/// threads' delegation queues.
pub struct DelegationPool {
    semaphore: Arc<Semaphore>,
}

impl DelegationPool {
    /// `workers` bounds the number of blocking closures running
    /// concurrently across the whole pool (default 32 per the
    /// specification).
    pub fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Open a new per-thread FIFO queue draining into this pool. The
    /// returned queue's background consumer task keeps running until
    /// every clone of the returned [`DelegationQueue`] (and the queue
    /// itself) is dropped.
    pub fn queue_for_thread(&self) -> DelegationQueue {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("delegation pool semaphore closed, dropping queued job");
                        continue;
                    }
                };
                tokio::task::spawn_blocking(move || {
                    job();
                    drop(permit);
                });
            }
        });

        DelegationQueue { tx }
    }

    /// Run `f` on a blocking-pool thread and await its result. A
    /// one-off convenience over [`DelegationQueue`] for callers that
    /// don't need a long-lived per-thread queue (e.g. a single delegated
    /// call from within an opcode handler).
    pub async fn run<F, T>(&self, f: F) -> Result<T, DelegationError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DelegationError::ShuttingDown)?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|_| DelegationError::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_executes_on_blocking_pool() {
        let pool = DelegationPool::new(4);
        let result = pool.run(|| 2 + 2).await.unwrap();
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn queue_preserves_submission_order_per_thread() {
        let pool = DelegationPool::new(1);
        let queue = pool.queue_for_thread();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            queue
                .submit(Box::new(move || {
                    order.lock().unwrap().push(i);
                }))
                .unwrap();
        }

        // Give the background consumer time to drain; this pool has
        // exactly one permit so jobs run strictly one at a time.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn bounded_concurrency_is_respected() {
        let pool = Arc::new(DelegationPool::new(2));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
