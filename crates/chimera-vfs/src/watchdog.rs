//! Background watchdog: periodic idle reclamation, overdue-request
//! logging, and user-cache expiry.
//!
//! `spec.md` §4/§5 calls for a per-thread periodic tick (default 1s)
//! that scans the in-flight request table for deadline overrun and the
//! open-file cache's idle LRU for reclaimable entries. The dispatcher
//! already discards a late completion the moment its deadline passes
//! (see [`crate::request::Dispatcher::run_with_deadline`]), so this
//! tick's job is the two things that genuinely need to run on a timer
//! rather than per-request: idle-handle reclamation and overdue-id
//! visibility for observability. The user cache's 60s expiry sweep
//! rides the same ticker at its own, independently configurable
//! period.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::open_cache::OpenFileCache;
use crate::request::Dispatcher;
use crate::user_cache::UserCache;

/// One watchdog, driving idle reclamation and expiry sweeps for a
/// single [`crate::verbs::Vfs`] instance.
pub struct Watchdog {
    dispatcher: Arc<Dispatcher>,
    open_cache: Arc<OpenFileCache>,
    user_cache: Arc<UserCache>,
    period: Duration,
    user_sweep_period: Duration,
}

impl Watchdog {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        open_cache: Arc<OpenFileCache>,
        user_cache: Arc<UserCache>,
        period: Duration,
        user_sweep_period: Duration,
    ) -> Self {
        Self {
            dispatcher,
            open_cache,
            user_cache,
            period,
            user_sweep_period,
        }
    }

    /// Run one tick: reclaim idle open-file-cache entries and report
    /// requests that have already overrun their deadline. Returns the
    /// handles reclaimed, for tests and for the caller's own metrics.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Vec<chimera_vfs_types::FileHandle> {
        let now = tokio::time::Instant::now();
        let overdue = self.dispatcher.overdue_ids(now);
        if !overdue.is_empty() {
            warn!(count = overdue.len(), ids = ?overdue, "requests overdue past deadline");
        }
        self.open_cache.reap_idle(now).await
    }

    /// Spawn the periodic tick and user-cache sweep as independent
    /// background tasks on the current runtime. Returns their join
    /// handles so a caller can abort them on shutdown.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let watchdog = self.clone();
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(watchdog.period);
            loop {
                interval.tick().await;
                watchdog.tick().await;
            }
        });

        let user_cache = self.user_cache.clone();
        let sweep_period = self.user_sweep_period;
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_period);
            loop {
                interval.tick().await;
                user_cache.sweep_expired();
            }
        });

        (tick_task, sweep_task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Capabilities, ModuleRegistry, ThreadState, VfsModule};
    use crate::open_cache::OpenFlags;
    use crate::request::{Opcode, Request, RequestResult};
    use async_trait::async_trait;
    use chimera_vfs_types::{Credential, FileHandle, ModuleTag, MountId, VfsResult};

    struct NoopModule;

    #[async_trait]
    impl VfsModule for NoopModule {
        fn tag(&self) -> ModuleTag {
            ModuleTag::Memfs
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                requires_open_for_io: true,
                ..Default::default()
            }
        }
        async fn dispatch(&self, _thread: ThreadState, _request: Request) -> VfsResult<RequestResult> {
            Ok(RequestResult::Unit)
        }
    }

    #[tokio::test]
    async fn tick_reaps_idle_handles() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(NoopModule));
        let registry = Arc::new(registry);
        let thread_pool = Arc::new(crate::thread_ctx::VfsThreadPool::new(1, 1));
        let open_cache = Arc::new(OpenFileCache::new(
            registry.clone(),
            thread_pool.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        ));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), open_cache.clone(), thread_pool, Duration::from_secs(5)));
        let user_cache = Arc::new(UserCache::new(Duration::from_secs(60)));

        let handle = FileHandle::new(MountId(1), ModuleTag::Memfs, vec![1]).unwrap();
        open_cache
            .open(handle.clone(), OpenFlags::read_write(), Credential::anonymous(), Arc::new(NoopModule))
            .await
            .unwrap();
        open_cache.unref(&handle);

        let watchdog = Watchdog::new(dispatcher, open_cache.clone(), user_cache, Duration::from_millis(5), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = watchdog.tick().await;
        assert_eq!(reaped, vec![handle]);
    }
}
