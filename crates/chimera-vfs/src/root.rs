//! The root pseudo-module: a synthetic, read-only directory whose
//! entries are the current mount points.
//!
//! Backed directly by the mount tree's snapshot rather than any
//! backend storage. Every mutating opcode returns `Rofs`; `lookup` of
//! a mounted name hands back that mount's backend root handle so a
//! client can descend from `/` into any export in one step.

use std::sync::Arc;

use async_trait::async_trait;
use chimera_vfs_types::{AttrMask, Attrs, DirEntry, FileHandle, FileType, ModuleTag, VfsError, VfsResult};

use crate::module::{Capabilities, ThreadState, VfsModule};
use crate::mount::MountTree;
use crate::request::{Opcode, Request, RequestArgs, RequestResult};

pub struct RootModule {
    mounts: Arc<MountTree>,
}

impl RootModule {
    pub fn new(mounts: Arc<MountTree>) -> Self {
        Self { mounts }
    }

    fn root_attrs() -> Attrs {
        Attrs {
            mask: AttrMask::common(),
            kind: Some(FileType::Directory),
            mode: Some(0o555),
            nlink: Some(2),
            uid: Some(0),
            gid: Some(0),
            size: Some(0),
            ..Default::default()
        }
    }
}

#[async_trait]
impl VfsModule for RootModule {
    fn tag(&self) -> ModuleTag {
        ModuleTag::Root
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn dispatch(&self, _thread: ThreadState, request: Request) -> VfsResult<RequestResult> {
        match (request.opcode, request.args) {
            (Opcode::GetAttr, RequestArgs::GetAttr { .. }) => Ok(RequestResult::Attr {
                attrs: Self::root_attrs(),
            }),
            (Opcode::Lookup, RequestArgs::Lookup { name, .. }) => {
                let client_path = format!("/{name}");
                let (entry, _remainder) = self.mounts.resolve(&client_path).await?;
                let payload = entry.backend_root.as_bytes().to_vec();
                let handle = FileHandle::new(entry.mount_id, entry.module_tag, payload)
                    .ok_or(VfsError::NameTooLong)?;
                Ok(RequestResult::Lookup {
                    handle,
                    attrs: Self::root_attrs(),
                })
            }
            (Opcode::Readdir, RequestArgs::Readdir { cookie, max_entries }) => {
                let mounts = self.mounts.list().await;
                let entries: Vec<DirEntry> = mounts
                    .into_iter()
                    .enumerate()
                    .skip(cookie as usize)
                    .take(max_entries.max(1) as usize)
                    .map(|(i, m)| DirEntry {
                        name: m.client_path.trim_start_matches('/').to_string(),
                        inode: i as u64 + 1,
                        kind: FileType::Directory,
                        attrs: None,
                        cookie: i as u64 + 1,
                    })
                    .collect();
                let total = self.mounts.list().await.len();
                let eof = cookie as usize + entries.len() >= total;
                Ok(RequestResult::Readdir { entries, eof })
            }
            (Opcode::StatFs, _) => Ok(RequestResult::StatFs {
                stat: Default::default(),
            }),
            (Opcode::Open, _) | (Opcode::Close, _) => Ok(RequestResult::Unit),
            _ => Err(VfsError::Rofs),
        }
    }
}
