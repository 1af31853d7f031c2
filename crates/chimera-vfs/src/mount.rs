//! The mount tree: longest-prefix routing from a client-visible path to
//! a backend module and mount id.
//!
//! Generalized from `vfs/mount.rs`'s `MountTable`, which routes
//! `VfsOps` calls directly by path. Here a mount additionally carries
//! the module tag it routes to (rather than holding the backend trait
//! object itself — modules are resolved through the
//! [`crate::module::ModuleRegistry`]) and an options bag, and
//! `unmount` enforces the `EBUSY` invariant via a per-mount open-handle
//! counter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chimera_vfs_types::{ModuleTag, MountId, VfsError, VfsResult};
use tokio::sync::RwLock;

use crate::module::ModuleRegistry;

/// Transport-agnostic mount options. Unrecognized keys in the source
/// config are accepted and logged at `warn`, never rejected — per the
/// specification's resolution for forward-compatible mount options.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub read_only: bool,
    pub version: Option<String>,
    pub proto: Option<String>,
    pub port: Option<u16>,
    pub extra: BTreeMap<String, String>,
}

/// One entry in the mount tree.
pub struct MountEntry {
    pub mount_id: MountId,
    pub module_tag: ModuleTag,
    /// Backend-local root, e.g. a subpath within a host directory or
    /// an in-memory namespace root. Opaque to the mount tree itself.
    pub backend_root: String,
    pub options: MountOptions,
    open_handles: AtomicU64,
}

impl MountEntry {
    pub fn open_handle_count(&self) -> u64 {
        self.open_handles.load(Ordering::SeqCst)
    }
}

/// Public, cloneable snapshot of a mount, returned by lookups and
/// listings so callers don't hold the tree's lock.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub client_path: String,
    pub mount_id: MountId,
    pub module_tag: ModuleTag,
    pub backend_root: String,
    pub options_read_only: bool,
}

/// Longest-prefix mount tree. Single-writer/many-reader via
/// `tokio::sync::RwLock`, matching the teacher's choice — a plain
/// sync lock would not cooperate correctly with the per-thread
/// cooperative scheduler's waiters.
pub struct MountTree {
    mounts: RwLock<BTreeMap<String, Arc<MountEntry>>>,
}

impl Default for MountTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTree {
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    fn normalize(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    /// Mount `module_tag` at `client_path`. Fails with `Exist` if a
    /// mount already occupies that exact path, or `NoModule` if the
    /// module isn't registered.
    pub async fn mount(
        &self,
        registry: &ModuleRegistry,
        client_path: &str,
        module_tag: ModuleTag,
        backend_root: String,
        options: MountOptions,
    ) -> VfsResult<MountId> {
        if !registry.is_loaded(module_tag) {
            return Err(VfsError::NoModule);
        }
        let path = Self::normalize(client_path);
        let mut mounts = self.mounts.write().await;
        if mounts.contains_key(&path) {
            return Err(VfsError::Exist);
        }
        let mount_id = MountId::derive(&path);
        mounts.insert(
            path,
            Arc::new(MountEntry {
                mount_id,
                module_tag,
                backend_root,
                options,
                open_handles: AtomicU64::new(0),
            }),
        );
        Ok(mount_id)
    }

    /// Unmount `client_path`. Fails with `NoEnt` if nothing is mounted
    /// there, or `Busy` if open handles still reference it.
    pub async fn unmount(&self, client_path: &str) -> VfsResult<()> {
        let path = Self::normalize(client_path);
        let mut mounts = self.mounts.write().await;
        let Some(entry) = mounts.get(&path) else {
            return Err(VfsError::NoEnt);
        };
        if entry.open_handle_count() > 0 {
            return Err(VfsError::Busy);
        }
        mounts.remove(&path);
        Ok(())
    }

    /// Resolve a client path to its mount and the remainder of the
    /// path relative to that mount's root.
    pub async fn resolve(&self, client_path: &str) -> VfsResult<(Arc<MountEntry>, String)> {
        let path = Self::normalize(client_path);
        let mounts = self.mounts.read().await;

        let mut best: Option<(&String, &Arc<MountEntry>)> = None;
        for (mount_path, entry) in mounts.iter() {
            let is_match = mount_path == "/"
                || path == *mount_path
                || path.starts_with(&format!("{mount_path}/"));
            if !is_match {
                continue;
            }
            if best.is_none() || mount_path.len() > best.unwrap().0.len() {
                best = Some((mount_path, entry));
            }
        }

        let (mount_path, entry) = best.ok_or(VfsError::NoEnt)?;
        let remainder = if mount_path == "/" {
            path.trim_start_matches('/').to_string()
        } else {
            path.strip_prefix(mount_path)
                .unwrap_or("")
                .trim_start_matches('/')
                .to_string()
        };
        Ok((entry.clone(), remainder))
    }

    pub async fn list(&self) -> Vec<MountInfo> {
        self.mounts
            .read()
            .await
            .iter()
            .map(|(path, entry)| MountInfo {
                client_path: path.clone(),
                mount_id: entry.mount_id,
                module_tag: entry.module_tag,
                backend_root: entry.backend_root.clone(),
                options_read_only: entry.options.read_only,
            })
            .collect()
    }

    /// Find the mount owning `mount_id`, used by the root pseudo-module
    /// and by handle validation.
    pub async fn by_mount_id(&self, mount_id: MountId) -> Option<Arc<MountEntry>> {
        self.mounts
            .read()
            .await
            .values()
            .find(|e| e.mount_id == mount_id)
            .cloned()
    }

    /// Record that one more handle under `mount_id` is open, blocking
    /// `unmount` until it's released.
    pub async fn note_handle_opened(&self, mount_id: MountId) {
        if let Some(entry) = self.by_mount_id(mount_id).await {
            entry.open_handles.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub async fn note_handle_closed(&self, mount_id: MountId) {
        if let Some(entry) = self.by_mount_id(mount_id).await {
            entry.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
