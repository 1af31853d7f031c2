//! Public VFS verb surface: the friendly, path- and handle-based API a
//! protocol front-end calls, composed over the [`Dispatcher`],
//! [`MountTree`], and [`OpenFileCache`] primitives.
//!
//! `lookup` is the one verb that walks a multi-component path: each
//! component is a separate `Opcode::Lookup` dispatch, and crossing
//! from the root pseudo-module into a mounted backend is simply an
//! ordinary lookup that happens to switch the handle's module tag —
//! no special-casing is needed for the mount boundary itself.

use std::sync::Arc;

use chimera_vfs_types::{
    AttrMask, Attrs, Credential, DirEntry, FileHandle, IoVecCursor, ModuleTag, MountId, SetAttrs,
    StatFs, VfsError, VfsResult,
};

use crate::config::VfsConfig;
use crate::kv::KvStore;
use crate::module::ModuleRegistry;
use crate::mount::{MountOptions, MountTree};
use crate::open_cache::{OpenFileCache, OpenFlags};
use crate::request::{Dispatcher, Opcode, RequestArgs, RequestResult};
use crate::root::RootModule;
use crate::thread_ctx::VfsThreadPool;

/// The assembled VFS core. Built once at startup from a populated
/// [`ModuleRegistry`] (every backend but the root pseudo-module already
/// registered — `Vfs::new` adds the root module itself, since it needs
/// the mount tree this constructor also creates).
pub struct Vfs {
    mounts: Arc<MountTree>,
    registry: Arc<ModuleRegistry>,
    open_cache: Arc<OpenFileCache>,
    dispatcher: Arc<Dispatcher>,
    thread_pool: Arc<VfsThreadPool>,
    kv_provider: Option<Arc<dyn KvStore>>,
}

impl Vfs {
    /// `kv_provider` is the backend designated to answer the key-value
    /// facility, typically the same `Arc` also registered in
    /// `registry` under its `VfsModule` face.
    pub fn new(mut registry: ModuleRegistry, config: &VfsConfig, kv_provider: Option<Arc<dyn KvStore>>) -> Arc<Self> {
        let mounts = Arc::new(MountTree::new());
        registry.register(Arc::new(RootModule::new(mounts.clone())));
        let registry = Arc::new(registry);
        let thread_pool = Arc::new(VfsThreadPool::new(config.core_threads, config.delegation_threads));
        let open_cache = Arc::new(OpenFileCache::new(
            registry.clone(),
            thread_pool.clone(),
            config.idle_close_timeout,
            config.request_timeout,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            open_cache.clone(),
            thread_pool.clone(),
            config.request_timeout,
        ));
        Arc::new(Self {
            mounts,
            registry,
            open_cache,
            dispatcher,
            thread_pool,
            kv_provider,
        })
    }

    pub fn mounts(&self) -> &Arc<MountTree> {
        &self.mounts
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn open_cache(&self) -> &Arc<OpenFileCache> {
        &self.open_cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn thread_pool(&self) -> &Arc<VfsThreadPool> {
        &self.thread_pool
    }

    pub fn root_handle(&self) -> FileHandle {
        FileHandle::root()
    }

    pub async fn mount(
        &self,
        client_path: &str,
        module_tag: ModuleTag,
        backend_root: String,
        options: MountOptions,
    ) -> VfsResult<MountId> {
        self.mounts.mount(&self.registry, client_path, module_tag, backend_root, options).await
    }

    pub async fn unmount(&self, client_path: &str) -> VfsResult<()> {
        self.mounts.unmount(client_path).await
    }

    /// Resolve a `/`-separated path, one `lookup` dispatch per
    /// component, starting from `start` (typically [`Self::root_handle`]).
    pub async fn lookup(&self, cred: Credential, start: FileHandle, path: &str) -> VfsResult<(FileHandle, Attrs)> {
        let mut current = start;
        let mut attrs = Attrs::default();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match self
                .dispatcher
                .dispatch(
                    Opcode::Lookup,
                    cred.clone(),
                    current.clone(),
                    None,
                    RequestArgs::Lookup {
                        name: component.to_string(),
                        mask: AttrMask::common(),
                    },
                )
                .await?
            {
                RequestResult::Lookup { handle, attrs: a } => {
                    current = handle;
                    attrs = a;
                }
                _ => return Err(VfsError::ServerFault),
            }
        }
        Ok((current, attrs))
    }

    pub async fn getattr(&self, cred: Credential, handle: FileHandle, mask: AttrMask) -> VfsResult<Attrs> {
        match self.dispatcher.dispatch(Opcode::GetAttr, cred, handle, None, RequestArgs::GetAttr { mask }).await? {
            RequestResult::Attr { attrs } => Ok(attrs),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn setattr(&self, cred: Credential, handle: FileHandle, attrs: SetAttrs) -> VfsResult<Attrs> {
        match self.dispatcher.dispatch(Opcode::SetAttr, cred, handle, None, RequestArgs::SetAttr { attrs }).await? {
            RequestResult::Attr { attrs } => Ok(attrs),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn mkdir(&self, cred: Credential, parent: FileHandle, name: &str, mode: u32) -> VfsResult<(FileHandle, Attrs)> {
        match self
            .dispatcher
            .dispatch(Opcode::Mkdir, cred, parent, None, RequestArgs::Mkdir { name: name.to_string(), mode })
            .await?
        {
            RequestResult::Created { handle, attrs } => Ok((handle, attrs)),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn mknod(&self, cred: Credential, parent: FileHandle, name: &str, mode: u32, rdev: u64) -> VfsResult<(FileHandle, Attrs)> {
        match self
            .dispatcher
            .dispatch(Opcode::Mknod, cred, parent, None, RequestArgs::Mknod { name: name.to_string(), mode, rdev })
            .await?
        {
            RequestResult::Created { handle, attrs } => Ok((handle, attrs)),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn symlink(&self, cred: Credential, parent: FileHandle, name: &str, target: &str) -> VfsResult<(FileHandle, Attrs)> {
        match self
            .dispatcher
            .dispatch(
                Opcode::Symlink,
                cred,
                parent,
                None,
                RequestArgs::Symlink { name: name.to_string(), target: target.to_string() },
            )
            .await?
        {
            RequestResult::Created { handle, attrs } => Ok((handle, attrs)),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn readlink(&self, cred: Credential, handle: FileHandle) -> VfsResult<String> {
        match self.dispatcher.dispatch(Opcode::Readlink, cred, handle, None, RequestArgs::Readlink).await? {
            RequestResult::Readlink { target } => Ok(target),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn link(&self, cred: Credential, source: FileHandle, new_parent: FileHandle, new_name: &str) -> VfsResult<(FileHandle, Attrs)> {
        match self
            .dispatcher
            .dispatch(Opcode::Link, cred, source, Some(new_parent), RequestArgs::Link { new_name: new_name.to_string() })
            .await?
        {
            RequestResult::Created { handle, attrs } => Ok((handle, attrs)),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn remove(&self, cred: Credential, parent: FileHandle, name: &str) -> VfsResult<()> {
        self.dispatcher
            .dispatch(Opcode::Remove, cred, parent, None, RequestArgs::Remove { name: name.to_string() })
            .await?;
        Ok(())
    }

    /// `dst_parent: None` renames within `src_parent`'s own directory.
    /// A cross-module `dst_parent` is rejected with `EXDEV` by the
    /// dispatcher before either backend is touched.
    pub async fn rename(
        &self,
        cred: Credential,
        src_parent: FileHandle,
        src_name: &str,
        dst_parent: Option<FileHandle>,
        dst_name: &str,
    ) -> VfsResult<()> {
        self.dispatcher
            .dispatch(
                Opcode::Rename,
                cred,
                src_parent,
                dst_parent,
                RequestArgs::Rename { src_name: src_name.to_string(), dst_name: dst_name.to_string() },
            )
            .await?;
        Ok(())
    }

    /// Opens `handle` through the open-file cache — single-flighting
    /// concurrent opens of the same handle onto one backend call — and
    /// records it against its mount's busy counter, so a concurrent
    /// `unmount` of the owning mount observes `Busy` until the matching
    /// [`Self::close`].
    pub async fn open(&self, cred: Credential, handle: FileHandle, create: bool, truncate: bool, exclusive: bool) -> VfsResult<()> {
        let module = self.registry.get(handle.module_tag()).ok_or(VfsError::NoModule)?;
        let flags = OpenFlags {
            read: true,
            write: true,
            create,
            truncate,
            exclusive,
        };
        self.open_cache.open(handle.clone(), flags, cred, module).await?;
        self.mounts.note_handle_opened(handle.mount_id()).await;
        Ok(())
    }

    /// Drops this caller's reference. The backend `close` itself is
    /// delegated: it only actually runs once the handle is both
    /// unreferenced and idle past the configured timeout, reclaimed by
    /// the watchdog's [`OpenFileCache::reap_idle`] sweep.
    pub async fn close(&self, _cred: Credential, handle: FileHandle) -> VfsResult<()> {
        self.open_cache.unref(&handle);
        self.mounts.note_handle_closed(handle.mount_id()).await;
        Ok(())
    }

    pub async fn read(&self, cred: Credential, handle: FileHandle, offset: u64, length: u32) -> VfsResult<(Vec<u8>, bool)> {
        match self.dispatcher.dispatch(Opcode::Read, cred, handle, None, RequestArgs::Read { offset, length }).await? {
            RequestResult::Read { data, eof } => Ok((data, eof)),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn write(&self, cred: Credential, handle: FileHandle, offset: u64, data: IoVecCursor) -> VfsResult<u32> {
        match self.dispatcher.dispatch(Opcode::Write, cred, handle, None, RequestArgs::Write { offset, data }).await? {
            RequestResult::Write { written } => Ok(written),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn commit(&self, cred: Credential, handle: FileHandle, offset: u64, length: u32) -> VfsResult<()> {
        self.dispatcher.dispatch(Opcode::Commit, cred, handle, None, RequestArgs::Commit { offset, length }).await?;
        Ok(())
    }

    pub async fn readdir(&self, cred: Credential, handle: FileHandle, cookie: u64, max_entries: u32) -> VfsResult<(Vec<DirEntry>, bool)> {
        match self
            .dispatcher
            .dispatch(Opcode::Readdir, cred, handle, None, RequestArgs::Readdir { cookie, max_entries })
            .await?
        {
            RequestResult::Readdir { entries, eof } => Ok((entries, eof)),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn statfs(&self, cred: Credential, handle: FileHandle) -> VfsResult<StatFs> {
        match self.dispatcher.dispatch(Opcode::StatFs, cred, handle, None, RequestArgs::StatFs).await? {
            RequestResult::StatFs { stat } => Ok(stat),
            _ => Err(VfsError::ServerFault),
        }
    }

    pub async fn kv_put(&self, key: Vec<u8>, value: Vec<u8>) -> VfsResult<()> {
        self.kv_provider.as_ref().ok_or(VfsError::NotSupp)?.put(key, value).await
    }

    pub async fn kv_get(&self, key: &[u8]) -> VfsResult<Vec<u8>> {
        self.kv_provider.as_ref().ok_or(VfsError::NotSupp)?.get(key).await
    }

    pub async fn kv_delete(&self, key: &[u8]) -> VfsResult<()> {
        self.kv_provider.as_ref().ok_or(VfsError::NotSupp)?.delete(key).await
    }

    pub async fn kv_search(
        &self,
        low: &[u8],
        high: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> VfsResult<usize> {
        self.kv_provider.as_ref().ok_or(VfsError::NotSupp)?.search(low, high, visit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemfsBackend;

    fn vfs_with_memfs() -> Arc<Vfs> {
        let memfs = Arc::new(MemfsBackend::new());
        let mut registry = ModuleRegistry::new();
        registry.register(memfs.clone());
        Vfs::new(registry, &VfsConfig::default(), Some(memfs))
    }

    #[tokio::test]
    async fn mount_lookup_mkdir_round_trip() {
        let vfs = vfs_with_memfs();
        vfs.mount("/data", ModuleTag::Memfs, String::new(), MountOptions::default()).await.unwrap();

        let (mount_handle, _) = vfs.lookup(Credential::anonymous(), vfs.root_handle(), "data").await.unwrap();
        let (_, attrs) = vfs
            .mkdir(Credential::anonymous(), mount_handle.clone(), "sub", 0o755)
            .await
            .unwrap();
        assert_eq!(attrs.kind, Some(chimera_vfs_types::FileType::Directory));

        let (_, attrs) = vfs.lookup(Credential::anonymous(), mount_handle, "sub").await.unwrap();
        assert_eq!(attrs.kind, Some(chimera_vfs_types::FileType::Directory));
    }

    #[tokio::test]
    async fn kv_round_trip_through_verbs() {
        let vfs = vfs_with_memfs();
        vfs.kv_put(vec![1, 2, 3], b"value".to_vec()).await.unwrap();
        assert_eq!(vfs.kv_get(&[1, 2, 3]).await.unwrap(), b"value");
        vfs.kv_delete(&[1, 2, 3]).await.unwrap();
        assert_eq!(vfs.kv_get(&[1, 2, 3]).await.unwrap_err(), VfsError::NoEnt);
    }

    #[tokio::test]
    async fn unmount_while_busy_then_after_close() {
        let vfs = vfs_with_memfs();
        vfs.mount("/data", ModuleTag::Memfs, String::new(), MountOptions::default()).await.unwrap();
        let (mount_handle, _) = vfs.lookup(Credential::anonymous(), vfs.root_handle(), "data").await.unwrap();

        vfs.open(Credential::anonymous(), mount_handle.clone(), false, false, false).await.unwrap();
        assert_eq!(vfs.unmount("/data").await.unwrap_err(), VfsError::Busy);
        vfs.close(Credential::anonymous(), mount_handle).await.unwrap();
        assert!(vfs.unmount("/data").await.is_ok());
    }
}
