//! Per-thread VFS execution context.
//!
//! `spec.md` §4.5 describes long-lived OS threads, each running a
//! cooperative single-threaded event loop that owns the thread-local
//! resources (request free list, delegation queue, watchdog timer) a
//! backend module wants pinned to one thread. Modeled here as a pool
//! of OS threads (`std::thread::Builder`), each driving its own
//! single-threaded `tokio` runtime and a `tokio::task::LocalSet`, so a
//! `!Send` per-thread value never has to cross threads — matching
//! "completion runs on the submitting thread's event loop" structurally
//! rather than by convention.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chimera_vfs_types::{hash::fingerprint64, FileHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::delegation::DelegationPool;

/// A unit of work handed to a core thread's `LocalSet`: a closure that,
/// once called on that thread, produces the future the thread's own
/// executor drives to completion.
type LocalJob = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()>>> + Send>;

struct VfsThread {
    tx: mpsc::UnboundedSender<LocalJob>,
    _handle: std::thread::JoinHandle<()>,
}

/// A pool of VFS core threads, each an independent single-threaded
/// `tokio` runtime. [`Self::thread_index_for`] derives a stable thread
/// assignment from a handle's fingerprint so every dispatch for the
/// same handle lands on the same core thread and any per-thread module
/// state stays affinitized; [`Self::run_on`] submits arbitrary work to
/// a specific thread and awaits its result from the caller's own task.
pub struct VfsThreadPool {
    threads: Vec<VfsThread>,
    next: AtomicUsize,
    pub delegation: Arc<DelegationPool>,
}

impl VfsThreadPool {
    pub fn new(core_threads: usize, delegation_workers: usize) -> Self {
        let core_threads = core_threads.max(1);
        let delegation = Arc::new(DelegationPool::new(delegation_workers));
        let threads = (0..core_threads).map(Self::spawn_thread).collect();
        Self {
            threads,
            next: AtomicUsize::new(0),
            delegation,
        }
    }

    fn spawn_thread(index: usize) -> VfsThread {
        let (tx, mut rx) = mpsc::unbounded_channel::<LocalJob>();
        let handle = std::thread::Builder::new()
            .name(format!("vfs-core-{index}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(thread = index, error = %err, "failed to build VFS core-thread runtime");
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    // `spawn_local` rather than calling the job inline:
                    // a thread's in-flight jobs must interleave at
                    // their own await points like any other
                    // cooperative event loop, not run one to
                    // completion before the next is even polled.
                    while let Some(job) = rx.recv().await {
                        tokio::task::spawn_local(job());
                    }
                });
            })
            .expect("failed to spawn VFS core thread");
        VfsThread { tx, _handle: handle }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Stable thread assignment for `handle`, derived from its wire
    /// fingerprint.
    pub fn thread_index_for(&self, handle: &FileHandle) -> usize {
        (fingerprint64(&handle.to_wire()) as usize) % self.threads.len()
    }

    /// Round-robin thread pick, for work with no handle affinity (e.g.
    /// mount/unmount).
    pub fn next_thread(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len()
    }

    /// Run `f` on core thread `index`: `f` is called on that thread and
    /// its returned future is driven to completion by that thread's own
    /// `LocalSet`, and the caller awaits the result from its own task.
    /// This is how a module dispatch actually ends up executing on the
    /// handle-affinitized thread rather than the ambient runtime.
    pub async fn run_on<F, Fut, T>(&self, index: usize, f: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: LocalJob = Box::new(move || {
            Box::pin(async move {
                let result = f().await;
                let _ = tx.send(result);
            }) as Pin<Box<dyn Future<Output = ()>>>
        });
        self.threads[index % self.threads.len()]
            .tx
            .send(job)
            .expect("VFS core thread unexpectedly stopped");
        rx.await.expect("VFS core thread dropped the result sender")
    }
}
