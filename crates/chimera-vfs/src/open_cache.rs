//! The open-file cache: ref-counted, single-flight opens, delegated
//! close, and idle reclamation.
//!
//! Grounded in structure on `mcp_pool.rs`'s connection pool
//! (register/lookup/remove over a concurrent map, with per-entry async
//! coordination for the connect-in-progress case), generalized from
//! "a shared MCP server connection" to "a backend's open handle for a
//! file." Concurrent opens of the same handle are coalesced exactly as
//! the specification requires: the first caller performs the backend
//! open, every other concurrent caller waits on a `Notify` and then
//! picks up the result — including a failed or timed-out open, which
//! is recorded once and observed by every waiter rather than only the
//! first to check.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chimera_vfs_types::{Credential, FileHandle, VfsError, VfsResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::module::{ModuleRegistry, VfsModule};
use crate::request::{dispatch_with_deadline, Opcode, Request, RequestArgs};
use crate::thread_ctx::VfsThreadPool;

/// Open-mode flags, grounded on the teacher's `OpenFlags` bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn create_exclusive() -> Self {
        Self {
            create: true,
            exclusive: true,
            ..Self::create()
        }
    }

    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }
}

/// A live open-file-cache entry.
///
/// `refcount` is the number of outstanding `open` handles a caller
/// holds; `pending_requests` is the number of in-flight operations
/// currently using the entry without holding their own ref (the
/// dispatcher's transparent open-for-io path). The watchdog only reaps
/// an entry once both are zero and it has sat idle past the
/// configured timeout.
pub struct OpenEntry {
    handle: FileHandle,
    module: Arc<dyn VfsModule>,
    refcount: AtomicU64,
    pending_requests: AtomicU64,
    last_use: Mutex<tokio::time::Instant>,
    closing: AtomicBool,
}

impl OpenEntry {
    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_use.lock() = tokio::time::Instant::now();
    }

    /// Mark the start of an in-flight operation riding on this entry
    /// without its own `open` ref (the dispatcher's transparent
    /// open-for-io continuation). Pairs with [`Self::end_request`].
    pub fn begin_request(&self) {
        self.pending_requests.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn end_request(&self) {
        self.pending_requests.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    fn is_idle(&self) -> bool {
        self.refcount.load(Ordering::SeqCst) == 0
            && self.pending_requests.load(Ordering::SeqCst) == 0
    }
}

/// An open in progress. Every concurrent caller coalescing onto it
/// waits on `notify`; if the backend open fails or times out, the
/// initiator records the error in `outcome` before notifying, so every
/// waiter observes the same failure instead of only the first one
/// (and, unlike the first caller simply taking the result, none of
/// them re-initiate a fresh backend open).
struct PendingOpen {
    notify: Notify,
    outcome: OnceLock<VfsError>,
}

/// The cache itself: one entry per currently-open handle, plus a side
/// table of in-progress opens so concurrent callers for the same
/// handle coalesce onto a single backend call.
pub struct OpenFileCache {
    entries: DashMap<FileHandle, Arc<OpenEntry>>,
    opening: DashMap<FileHandle, Arc<PendingOpen>>,
    registry: Arc<ModuleRegistry>,
    thread_pool: Arc<VfsThreadPool>,
    idle_timeout: Duration,
    request_timeout: Duration,
}

impl OpenFileCache {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        thread_pool: Arc<VfsThreadPool>,
        idle_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            opening: DashMap::new(),
            registry,
            thread_pool,
            idle_timeout,
            request_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_open(&self, handle: &FileHandle) -> bool {
        self.entries.contains_key(handle)
    }

    /// Resolve an open handle for `handle`, performing the backend
    /// open exactly once across any number of concurrent callers.
    #[instrument(skip(self, module))]
    pub async fn open(
        &self,
        handle: FileHandle,
        flags: OpenFlags,
        cred: Credential,
        module: Arc<dyn VfsModule>,
    ) -> VfsResult<Arc<OpenEntry>> {
        loop {
            if let Some(entry) = self.entries.get(&handle) {
                entry.refcount.fetch_add(1, Ordering::SeqCst);
                entry.touch();
                return Ok(entry.clone());
            }

            // Someone else is already opening this handle: wait for
            // them to finish and retry the fast path above, or return
            // their recorded failure if the open didn't succeed.
            if let Some(pending) = self.opening.get(&handle).map(|p| p.clone()) {
                pending.notify.notified().await;
                if let Some(err) = pending.outcome.get() {
                    return Err(*err);
                }
                continue;
            }

            let pending = Arc::new(PendingOpen {
                notify: Notify::new(),
                outcome: OnceLock::new(),
            });
            match self.opening.entry(handle.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(pending.clone());
                }
            }

            let result = self.do_open(&handle, flags, cred.clone(), module.clone()).await;
            if let Err(err) = &result {
                let _ = pending.outcome.set(*err);
            }
            self.opening.remove(&handle);
            pending.notify.notify_waiters();

            return result;
        }
    }

    async fn do_open(
        &self,
        handle: &FileHandle,
        flags: OpenFlags,
        cred: Credential,
        module: Arc<dyn VfsModule>,
    ) -> VfsResult<Arc<OpenEntry>> {
        let deadline = tokio::time::Instant::now() + self.request_timeout;
        let request = Request::new(
            0,
            Opcode::Open,
            cred,
            handle.clone(),
            None,
            RequestArgs::Open {
                create: flags.create,
                truncate: flags.truncate,
                exclusive: flags.exclusive,
            },
            deadline,
        );
        let thread_index = self.thread_pool.thread_index_for(handle);
        self.thread_pool
            .run_on(thread_index, move || async move {
                let thread = module.thread_init().await;
                dispatch_with_deadline(module, thread, request).await
            })
            .await?;

        let entry = Arc::new(OpenEntry {
            handle: handle.clone(),
            module,
            refcount: AtomicU64::new(1),
            pending_requests: AtomicU64::new(0),
            last_use: Mutex::new(tokio::time::Instant::now()),
            closing: AtomicBool::new(false),
        });
        self.registry.note_handle_opened(handle.module_tag());
        self.entries.insert(handle.clone(), entry.clone());
        debug!(handle = ?handle, "opened");
        Ok(entry)
    }

    /// Drop one reference. The handle is not closed immediately — that
    /// only happens once it is both unreferenced and idle past the
    /// configured timeout, reclaimed by [`Self::reap_idle`].
    pub fn unref(&self, handle: &FileHandle) {
        if let Some(entry) = self.entries.get(handle) {
            entry.refcount.fetch_sub(1, Ordering::SeqCst);
            entry.touch();
        }
    }

    /// Force an entry closed regardless of refcount or idle state. The
    /// ordinary `close` verb only decrements the refcount
    /// ([`Self::unref`]) and lets [`Self::reap_idle`] perform the
    /// backend close once the entry goes idle; this is for a caller
    /// that needs the backend handle released immediately (e.g.
    /// revoking a lease). No-op if the handle isn't cached.
    pub async fn close_now(&self, handle: &FileHandle) -> VfsResult<()> {
        if let Some((_, entry)) = self.entries.remove(handle) {
            self.close_entry(&entry).await?;
        }
        Ok(())
    }

    async fn close_entry(&self, entry: &Arc<OpenEntry>) -> VfsResult<()> {
        if entry.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + self.request_timeout;
        let request = Request::new(
            0,
            Opcode::Close,
            Credential::anonymous(),
            entry.handle.clone(),
            None,
            RequestArgs::Close,
            deadline,
        );
        let module = entry.module.clone();
        let thread_index = self.thread_pool.thread_index_for(&entry.handle);
        let result = self
            .thread_pool
            .run_on(thread_index, move || async move {
                let thread = module.thread_init().await;
                dispatch_with_deadline(module, thread, request).await
            })
            .await;
        self.registry.note_handle_closed(entry.handle.module_tag());
        debug!(handle = ?entry.handle, "closed");
        result.map(|_| ())
    }

    /// Sweep for entries idle past the configured timeout with no
    /// refs and no in-flight requests, closing each through the
    /// backend. Called by the watchdog; returns the handles reclaimed.
    pub async fn reap_idle(&self, now: tokio::time::Instant) -> Vec<FileHandle> {
        let candidates: Vec<Arc<OpenEntry>> = self
            .entries
            .iter()
            .filter(|e| e.is_idle() && now.duration_since(*e.last_use.lock()) >= self.idle_timeout)
            .map(|e| e.value().clone())
            .collect();

        let mut reaped = Vec::new();
        for entry in candidates {
            // Re-check idleness under removal: a racing `open` may
            // have resurrected the entry between the scan above and
            // now.
            if !entry.is_idle() {
                continue;
            }
            if self.entries.remove(&entry.handle).is_some() && self.close_entry(&entry).await.is_ok() {
                reaped.push(entry.handle.clone());
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Capabilities, ThreadState};
    use crate::request::RequestResult;
    use chimera_vfs_types::ModuleTag;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct CountingModule {
        tag: ModuleTag,
        opens: StdAtomicU64,
        closes: StdAtomicU64,
    }

    #[async_trait::async_trait]
    impl VfsModule for CountingModule {
        fn tag(&self) -> ModuleTag {
            self.tag
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                requires_open_for_io: true,
                ..Default::default()
            }
        }

        async fn dispatch(&self, _thread: ThreadState, request: Request) -> VfsResult<RequestResult> {
            match request.opcode {
                Opcode::Open => {
                    self.opens.fetch_add(1, Ordering::SeqCst);
                    Ok(RequestResult::Unit)
                }
                Opcode::Close => {
                    self.closes.fetch_add(1, Ordering::SeqCst);
                    Ok(RequestResult::Unit)
                }
                _ => Ok(RequestResult::Unit),
            }
        }
    }

    fn handle() -> FileHandle {
        FileHandle::new(chimera_vfs_types::MountId(1), ModuleTag::Memfs, vec![7]).unwrap()
    }

    fn thread_pool() -> Arc<VfsThreadPool> {
        Arc::new(VfsThreadPool::new(1, 1))
    }

    #[tokio::test]
    async fn concurrent_opens_of_same_handle_single_flight() {
        let registry = Arc::new(ModuleRegistry::new());
        let module: Arc<dyn VfsModule> = Arc::new(CountingModule {
            tag: ModuleTag::Memfs,
            opens: StdAtomicU64::new(0),
            closes: StdAtomicU64::new(0),
        });
        let cache = Arc::new(OpenFileCache::new(
            registry,
            thread_pool(),
            Duration::from_millis(10),
            Duration::from_secs(5),
        ));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let module = module.clone();
            let handle = handle();
            tasks.push(tokio::spawn(async move {
                cache
                    .open(handle, OpenFlags::read_write(), Credential::anonymous(), module)
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.len(), 1);
        let entry = cache.entries.get(&handle()).unwrap();
        assert_eq!(entry.refcount(), 8);
    }

    #[tokio::test]
    async fn unref_then_idle_reap_closes_backend() {
        let registry = Arc::new(ModuleRegistry::new());
        let module = Arc::new(CountingModule {
            tag: ModuleTag::Memfs,
            opens: StdAtomicU64::new(0),
            closes: StdAtomicU64::new(0),
        });
        let cache = OpenFileCache::new(
            registry,
            thread_pool(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let entry = cache
            .open(
                handle(),
                OpenFlags::read_write(),
                Credential::anonymous(),
                module.clone(),
            )
            .await
            .unwrap();
        assert_eq!(entry.refcount(), 1);
        cache.unref(&handle());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = cache.reap_idle(tokio::time::Instant::now()).await;
        assert_eq!(reaped, vec![handle()]);
        assert!(!cache.has_open(&handle()));
        assert_eq!(module.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_request_blocks_reap() {
        let registry = Arc::new(ModuleRegistry::new());
        let module = Arc::new(CountingModule {
            tag: ModuleTag::Memfs,
            opens: StdAtomicU64::new(0),
            closes: StdAtomicU64::new(0),
        });
        let cache = OpenFileCache::new(
            registry,
            thread_pool(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let entry = cache
            .open(
                handle(),
                OpenFlags::read_write(),
                Credential::anonymous(),
                module,
            )
            .await
            .unwrap();
        cache.unref(&handle());
        entry.begin_request();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = cache.reap_idle(tokio::time::Instant::now()).await;
        assert!(reaped.is_empty());
        assert!(cache.has_open(&handle()));
    }

    struct HangingModule {
        tag: ModuleTag,
        attempts: StdAtomicU64,
    }

    #[async_trait::async_trait]
    impl VfsModule for HangingModule {
        fn tag(&self) -> ModuleTag {
            self.tag
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                requires_open_for_io: true,
                ..Default::default()
            }
        }

        async fn dispatch(&self, _thread: ThreadState, request: Request) -> VfsResult<RequestResult> {
            if let Opcode::Open = request.opcode {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                // Never resolves within any reasonable deadline.
                std::future::pending::<()>().await;
            }
            Ok(RequestResult::Unit)
        }
    }

    #[tokio::test]
    async fn all_coalesced_waiters_see_a_timed_out_open() {
        let registry = Arc::new(ModuleRegistry::new());
        let module = Arc::new(HangingModule {
            tag: ModuleTag::Memfs,
            attempts: StdAtomicU64::new(0),
        });
        let cache = Arc::new(OpenFileCache::new(
            registry,
            thread_pool(),
            Duration::from_secs(60),
            Duration::from_millis(20),
        ));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let module: Arc<dyn VfsModule> = module.clone();
            tasks.push(tokio::spawn(async move {
                cache.open(handle(), OpenFlags::read_write(), Credential::anonymous(), module).await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(VfsError::TimedOut));
        }
        assert!(!cache.has_open(&handle()));
        // Only the single initiator actually dispatched an open; every
        // other caller observed the recorded failure instead of
        // re-dispatching its own.
        assert_eq!(module.attempts.load(Ordering::SeqCst), 1);
    }
}
