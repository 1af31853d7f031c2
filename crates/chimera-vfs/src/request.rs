//! The uniform asynchronous request model: opcodes, the reusable
//! request record, the per-thread free list, and the dispatcher that
//! routes a request to its backend module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chimera_vfs_types::{
    AttrMask, Attrs, Credential, DirEntry, FileHandle, IoVecCursor, SetAttrs, StatFs, VfsError,
    VfsResult,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::instrument;

use crate::module::{ModuleRegistry, ThreadState, VfsModule};
use crate::open_cache::OpenFileCache;
use crate::thread_ctx::VfsThreadPool;

/// Request opcode discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Lookup,
    Readlink,
    Mkdir,
    Mknod,
    Remove,
    Rename,
    Symlink,
    Link,
    Open,
    Close,
    Read,
    Write,
    Commit,
    Readdir,
    GetAttr,
    SetAttr,
    StatFs,
}

impl Opcode {
    /// Opcodes in the I/O class: a module whose capability mask sets
    /// `requires_open_for_io` needs an open handle held before these
    /// run, and the dispatcher transparently wraps a bare call in an
    /// `open -> op -> close` continuation when none is held.
    pub fn is_io_class(self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::Commit)
    }
}

/// Op-specific request arguments. One variant per [`Opcode`].
#[derive(Debug, Clone)]
pub enum RequestArgs {
    Lookup { name: String, mask: AttrMask },
    Readlink,
    Mkdir { name: String, mode: u32 },
    Mknod { name: String, mode: u32, rdev: u64 },
    Remove { name: String },
    Rename { src_name: String, dst_name: String },
    Symlink { name: String, target: String },
    Link { new_name: String },
    Open { create: bool, truncate: bool, exclusive: bool },
    Close,
    Read { offset: u64, length: u32 },
    Write { offset: u64, data: IoVecCursor },
    Commit { offset: u64, length: u32 },
    Readdir { cookie: u64, max_entries: u32 },
    GetAttr { mask: AttrMask },
    SetAttr { attrs: SetAttrs },
    StatFs,
}

/// Op-specific request result. One variant per [`Opcode`] family.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    Lookup { handle: FileHandle, attrs: Attrs },
    Readlink { target: String },
    Created { handle: FileHandle, attrs: Attrs },
    Attr { attrs: Attrs },
    Read { data: Vec<u8>, eof: bool },
    Write { written: u32 },
    Readdir { entries: Vec<DirEntry>, eof: bool },
    StatFs { stat: StatFs },
    Unit,
}

/// A reusable request record: opcode, credential, handle(s),
/// op-specific argument union, and a deadline the watchdog enforces.
///
/// In the source this also carries a completion callback and an
/// owning-thread back-pointer. Here "the completion callback runs on
/// the owning thread" falls out of the dispatcher always `.await`ing
/// (or timing out on) the module's future from the caller's own task,
/// so no explicit callback field is needed — see [`Dispatcher::dispatch`].
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub opcode: Opcode,
    pub cred: Credential,
    pub primary: FileHandle,
    pub secondary: Option<FileHandle>,
    pub args: RequestArgs,
    pub deadline: tokio::time::Instant,
}

impl Request {
    pub fn new(
        id: u64,
        opcode: Opcode,
        cred: Credential,
        primary: FileHandle,
        secondary: Option<FileHandle>,
        args: RequestArgs,
        deadline: tokio::time::Instant,
    ) -> Self {
        Self {
            id,
            opcode,
            cred,
            primary,
            secondary,
            args,
            deadline,
        }
    }
}

/// A free-listed request slot: just the recycled id and a scratch
/// buffer backends may reuse for small payloads, avoiding per-request
/// allocation churn for the common small-write/small-readdir-batch
/// case.
#[derive(Debug, Default)]
pub struct RequestSlot {
    pub id: u64,
    pub scratch: Vec<u8>,
}

/// The request free list. The source keeps one of these per VFS
/// thread with no locking; this workspace's VFS core is shared across
/// a `tokio` runtime rather than pinned to literal OS threads (see
/// `thread_ctx.rs`), so the pool is guarded by an uncontended
/// `parking_lot::Mutex` instead. Correctness is unaffected — only the
/// lock-free property is traded away.
#[derive(Default)]
pub struct RequestPool {
    free: Mutex<Vec<RequestSlot>>,
    next_id: AtomicU64,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot from the free list, or mint a fresh one.
    pub fn take(&self) -> RequestSlot {
        if let Some(mut slot) = self.free.lock().pop() {
            slot.scratch.clear();
            slot
        } else {
            RequestSlot {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                scratch: Vec::new(),
            }
        }
    }

    /// Return a slot to the free list. Each slot taken by [`Self::take`]
    /// must be recycled exactly once.
    pub fn recycle(&self, slot: RequestSlot) {
        self.free.lock().push(slot);
    }

    pub fn free_list_len(&self) -> usize {
        self.free.lock().len()
    }
}

/// Races a module's dispatch against `request.deadline`, on whichever
/// thread the caller is already running on. Shared by [`Dispatcher`]
/// and [`crate::open_cache::OpenFileCache`] so both honor the same
/// deadline-enforcement rule instead of one of them dispatching
/// straight through.
pub(crate) async fn dispatch_with_deadline(
    module: Arc<dyn VfsModule>,
    thread: ThreadState,
    request: Request,
) -> VfsResult<RequestResult> {
    let deadline = request.deadline;
    match tokio::time::timeout_at(deadline, module.dispatch(thread, request)).await {
        Ok(result) => result,
        // Deadline passed; the in-flight dispatch future is dropped
        // here rather than kept running, so a hung backend call is
        // actually abandoned, not merely ignored.
        Err(_elapsed) => Err(VfsError::TimedOut),
    }
}

/// Routes requests to backend modules by file-handle tag, enforces
/// deadlines, and runs each dispatch on the handle's affinitized VFS
/// core thread.
pub struct Dispatcher {
    registry: Arc<ModuleRegistry>,
    open_cache: Arc<OpenFileCache>,
    thread_pool: Arc<VfsThreadPool>,
    pool: RequestPool,
    inflight: DashMap<u64, tokio::time::Instant>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        open_cache: Arc<OpenFileCache>,
        thread_pool: Arc<VfsThreadPool>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            open_cache,
            thread_pool,
            pool: RequestPool::new(),
            inflight: DashMap::new(),
            default_timeout,
        }
    }

    /// Number of requests currently tracked as in-flight (for watchdog
    /// enforcement and tests).
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Called by the watchdog: returns ids whose deadline has already
    /// passed.
    pub fn overdue_ids(&self, now: tokio::time::Instant) -> Vec<u64> {
        self.inflight
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Dispatch one operation end to end: resolves the module,
    /// enforces the `EXDEV` rule for mismatched secondary handles,
    /// transparently opens/closes for opcodes that require an open
    /// handle, races the backend against the deadline, and always
    /// recycles the request slot exactly once.
    #[instrument(skip(self, args), fields(opcode = ?opcode))]
    pub async fn dispatch(
        &self,
        opcode: Opcode,
        cred: Credential,
        primary: FileHandle,
        secondary: Option<FileHandle>,
        args: RequestArgs,
    ) -> VfsResult<RequestResult> {
        if let Some(ref secondary) = secondary {
            if secondary.module_tag() != primary.module_tag() {
                return Err(VfsError::XDev);
            }
        }

        let module = self
            .registry
            .get(primary.module_tag())
            .ok_or(VfsError::NoModule)?;

        let slot = self.pool.take();
        let deadline = tokio::time::Instant::now() + self.default_timeout;
        self.inflight.insert(slot.id, deadline);

        let needs_open = opcode.is_io_class() && module.capabilities().requires_open_for_io;

        let result = if needs_open {
            self.dispatch_with_transparent_open(
                module,
                slot.id,
                opcode,
                cred,
                primary,
                secondary,
                args,
                deadline,
            )
            .await
        } else {
            self.run_with_deadline(module, slot.id, opcode, cred, primary, secondary, args, deadline)
                .await
        };

        self.inflight.remove(&slot.id);
        self.pool.recycle(slot);
        result
    }

    async fn dispatch_with_transparent_open(
        &self,
        module: Arc<dyn crate::module::VfsModule>,
        id: u64,
        opcode: Opcode,
        cred: Credential,
        primary: FileHandle,
        secondary: Option<FileHandle>,
        args: RequestArgs,
        deadline: tokio::time::Instant,
    ) -> VfsResult<RequestResult> {
        let open_flags = crate::open_cache::OpenFlags::read_write();
        let entry = self
            .open_cache
            .open(primary.clone(), open_flags, cred.clone(), module.clone())
            .await?;
        entry.begin_request();
        let result = self
            .run_with_deadline(module, id, opcode, cred, primary.clone(), secondary, args, deadline)
            .await;
        entry.end_request();
        self.open_cache.unref(&primary);
        result
    }

    async fn run_with_deadline(
        &self,
        module: Arc<dyn VfsModule>,
        id: u64,
        opcode: Opcode,
        cred: Credential,
        primary: FileHandle,
        secondary: Option<FileHandle>,
        args: RequestArgs,
        deadline: tokio::time::Instant,
    ) -> VfsResult<RequestResult> {
        let thread_index = self.thread_pool.thread_index_for(&primary);
        let request = Request::new(id, opcode, cred, primary, secondary, args, deadline);
        self.thread_pool
            .run_on(thread_index, move || async move {
                let thread = module.thread_init().await;
                dispatch_with_deadline(module, thread, request).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Capabilities, ThreadState, VfsModule};
    use chimera_vfs_types::ModuleTag;

    struct EchoModule {
        tag: ModuleTag,
        requires_open: bool,
        delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl VfsModule for EchoModule {
        fn tag(&self) -> ModuleTag {
            self.tag
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                requires_open_for_io: self.requires_open,
                ..Default::default()
            }
        }

        async fn dispatch(&self, _thread: ThreadState, _request: Request) -> VfsResult<RequestResult> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(RequestResult::Attr {
                attrs: Attrs::default(),
            })
        }
    }

    fn registry_with(module: EchoModule) -> Arc<ModuleRegistry> {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(module));
        Arc::new(registry)
    }

    fn thread_pool() -> Arc<VfsThreadPool> {
        Arc::new(VfsThreadPool::new(1, 1))
    }

    #[tokio::test]
    async fn simple_dispatch_recycles_slot() {
        let registry = registry_with(EchoModule {
            tag: ModuleTag::Memfs,
            requires_open: false,
            delay: None,
        });
        let open_cache = Arc::new(OpenFileCache::new(
            registry.clone(),
            thread_pool(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let dispatcher = Dispatcher::new(registry, open_cache, thread_pool(), Duration::from_secs(5));

        let handle = FileHandle::new(chimera_vfs_types::MountId(1), ModuleTag::Memfs, vec![1]).unwrap();
        let result = dispatcher
            .dispatch(
                Opcode::GetAttr,
                Credential::anonymous(),
                handle,
                None,
                RequestArgs::GetAttr {
                    mask: AttrMask::common(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(result, RequestResult::Attr { .. }));
        assert_eq!(dispatcher.pool.free_list_len(), 1);
        assert_eq!(dispatcher.inflight_count(), 0);
    }

    #[tokio::test]
    async fn cross_module_secondary_is_xdev() {
        let registry = registry_with(EchoModule {
            tag: ModuleTag::Memfs,
            requires_open: false,
            delay: None,
        });
        let open_cache = Arc::new(OpenFileCache::new(
            registry.clone(),
            thread_pool(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let dispatcher = Dispatcher::new(registry, open_cache, thread_pool(), Duration::from_secs(5));

        let a = FileHandle::new(chimera_vfs_types::MountId(1), ModuleTag::Memfs, vec![1]).unwrap();
        let b = FileHandle::new(chimera_vfs_types::MountId(2), ModuleTag::Linux, vec![2]).unwrap();

        let result = dispatcher
            .dispatch(
                Opcode::Rename,
                Credential::anonymous(),
                a,
                Some(b),
                RequestArgs::Rename {
                    src_name: "a".into(),
                    dst_name: "b".into(),
                },
            )
            .await;
        assert_eq!(result, Err(VfsError::XDev));
    }

    #[tokio::test]
    async fn unknown_module_tag_is_nomodule() {
        let registry = Arc::new(ModuleRegistry::new());
        let open_cache = Arc::new(OpenFileCache::new(
            registry.clone(),
            thread_pool(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let dispatcher = Dispatcher::new(registry, open_cache, thread_pool(), Duration::from_secs(5));
        let handle = FileHandle::new(chimera_vfs_types::MountId(1), ModuleTag::Memfs, vec![1]).unwrap();
        let result = dispatcher
            .dispatch(
                Opcode::GetAttr,
                Credential::anonymous(),
                handle,
                None,
                RequestArgs::GetAttr {
                    mask: AttrMask::common(),
                },
            )
            .await;
        assert_eq!(result, Err(VfsError::NoModule));
    }

    #[tokio::test]
    async fn overdue_request_times_out() {
        let registry = registry_with(EchoModule {
            tag: ModuleTag::Memfs,
            requires_open: false,
            delay: Some(Duration::from_millis(200)),
        });
        let open_cache = Arc::new(OpenFileCache::new(
            registry.clone(),
            thread_pool(),
            Duration::from_secs(60),
            Duration::from_millis(10),
        ));
        let dispatcher = Dispatcher::new(registry, open_cache, thread_pool(), Duration::from_millis(10));
        let handle = FileHandle::new(chimera_vfs_types::MountId(1), ModuleTag::Memfs, vec![1]).unwrap();
        let result = dispatcher
            .dispatch(
                Opcode::GetAttr,
                Credential::anonymous(),
                handle,
                None,
                RequestArgs::GetAttr {
                    mask: AttrMask::common(),
                },
            )
            .await;
        assert_eq!(result, Err(VfsError::TimedOut));
    }
}
