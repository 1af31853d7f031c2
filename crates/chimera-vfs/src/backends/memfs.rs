//! In-memory reference backend.
//!
//! Grounded on `vfs/backends/memory.rs`'s `MemoryBackend`: a flat map
//! keyed by normalized path, generalized from a `VfsOps` trait object
//! addressed by `&Path` to a [`VfsModule`] addressed by [`FileHandle`]
//! whose payload carries the UTF-8 path relative to the mount. Also
//! implements [`KvStore`], making it the reference key-value provider.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use chimera_vfs_types::{
    AttrMask, Attrs, DirEntry, FileHandle, FileType, ModuleTag, MountId, SetAttrs, StatFs,
    VfsError, VfsResult,
};
use parking_lot::RwLock;

use crate::kv::KvStore;
use crate::module::{Capabilities, ThreadState, VfsModule};
use crate::request::{Opcode, Request, RequestArgs, RequestResult};

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attrs: Attrs },
    Directory { attrs: Attrs },
    Symlink { target: String, attrs: Attrs },
}

impl Entry {
    fn attrs(&self) -> Attrs {
        match self {
            Entry::File { attrs, .. } => attrs.clone(),
            Entry::Directory { attrs } => attrs.clone(),
            Entry::Symlink { attrs, .. } => attrs.clone(),
        }
    }

    fn kind(&self) -> FileType {
        match self {
            Entry::File { .. } => FileType::Regular,
            Entry::Directory { .. } => FileType::Directory,
            Entry::Symlink { .. } => FileType::Symlink,
        }
    }
}

fn file_attrs(mode: u32, size: u64) -> Attrs {
    let now = SystemTime::now();
    Attrs {
        mask: AttrMask::common(),
        kind: Some(FileType::Regular),
        mode: Some(mode),
        nlink: Some(1),
        uid: Some(0),
        gid: Some(0),
        size: Some(size),
        atime: Some(now),
        mtime: Some(now),
        ctime: Some(now),
        ..Default::default()
    }
}

fn dir_attrs(mode: u32) -> Attrs {
    Attrs {
        kind: Some(FileType::Directory),
        nlink: Some(2),
        uid: Some(0),
        gid: Some(0),
        size: Some(0),
        ..file_attrs(mode, 0)
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn path_of(handle: &FileHandle) -> String {
    String::from_utf8_lossy(handle.payload()).into_owned()
}

fn handle_for(mount_id: MountId, path: &str) -> VfsResult<FileHandle> {
    FileHandle::new(mount_id, ModuleTag::Memfs, path.as_bytes().to_vec()).ok_or(VfsError::NameTooLong)
}

/// In-memory filesystem. All data is lost when the module is dropped.
pub struct MemfsBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Default for MemfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemfsBackend {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(String::new(), Entry::Directory { attrs: dir_attrs(0o755) });
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl VfsModule for MemfsBackend {
    fn tag(&self) -> ModuleTag {
        ModuleTag::Memfs
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_open_for_io: false,
            cursor_based_readdir: true,
            kv: true,
            ..Default::default()
        }
    }

    async fn dispatch(&self, _thread: ThreadState, request: Request) -> VfsResult<RequestResult> {
        let mount_id = request.primary.mount_id();
        let path = path_of(&request.primary);

        match (request.opcode, request.args) {
            (Opcode::GetAttr, RequestArgs::GetAttr { .. }) => {
                let entries = self.entries.read();
                let entry = entries.get(&path).ok_or(VfsError::NoEnt)?;
                Ok(RequestResult::Attr { attrs: entry.attrs() })
            }

            (Opcode::SetAttr, RequestArgs::SetAttr { attrs }) => {
                let mut entries = self.entries.write();
                let entry = entries.get_mut(&path).ok_or(VfsError::NoEnt)?;
                apply_setattr(entry, &attrs);
                Ok(RequestResult::Attr { attrs: entry.attrs() })
            }

            (Opcode::Lookup, RequestArgs::Lookup { name, .. }) => {
                let child = join(&path, &name);
                let entries = self.entries.read();
                let entry = entries.get(&child).ok_or(VfsError::NoEnt)?;
                Ok(RequestResult::Lookup {
                    handle: handle_for(mount_id, &child)?,
                    attrs: entry.attrs(),
                })
            }

            (Opcode::Mkdir, RequestArgs::Mkdir { name, mode }) => {
                let child = join(&path, &name);
                let mut entries = self.entries.write();
                if !entries.contains_key(&path) {
                    return Err(VfsError::NoEnt);
                }
                if entries.contains_key(&child) {
                    return Err(VfsError::Exist);
                }
                let attrs = dir_attrs(mode);
                entries.insert(child.clone(), Entry::Directory { attrs: attrs.clone() });
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child)?,
                    attrs,
                })
            }

            (Opcode::Mknod, RequestArgs::Mknod { name, mode, .. }) => {
                let child = join(&path, &name);
                let mut entries = self.entries.write();
                if !entries.contains_key(&path) {
                    return Err(VfsError::NoEnt);
                }
                if entries.contains_key(&child) {
                    return Err(VfsError::Exist);
                }
                let attrs = file_attrs(mode, 0);
                entries.insert(
                    child.clone(),
                    Entry::File {
                        data: Vec::new(),
                        attrs: attrs.clone(),
                    },
                );
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child)?,
                    attrs,
                })
            }

            (Opcode::Symlink, RequestArgs::Symlink { name, target }) => {
                let child = join(&path, &name);
                let mut entries = self.entries.write();
                if entries.contains_key(&child) {
                    return Err(VfsError::Exist);
                }
                let attrs = file_attrs(0o777, target.len() as u64);
                entries.insert(
                    child.clone(),
                    Entry::Symlink {
                        target,
                        attrs: attrs.clone(),
                    },
                );
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child)?,
                    attrs,
                })
            }

            (Opcode::Readlink, RequestArgs::Readlink) => {
                let entries = self.entries.read();
                match entries.get(&path) {
                    Some(Entry::Symlink { target, .. }) => {
                        Ok(RequestResult::Readlink { target: target.clone() })
                    }
                    Some(_) => Err(VfsError::Inval),
                    None => Err(VfsError::NoEnt),
                }
            }

            (Opcode::Link, RequestArgs::Link { new_name }) => {
                let secondary = request.secondary.ok_or(VfsError::Inval)?;
                let new_parent = path_of(&secondary);
                let mut entries = self.entries.write();
                let source = entries.get(&path).cloned().ok_or(VfsError::NoEnt)?;
                if matches!(source, Entry::Directory { .. }) {
                    return Err(VfsError::Inval);
                }
                let child = join(&new_parent, &new_name);
                if entries.contains_key(&child) {
                    return Err(VfsError::Exist);
                }
                let attrs = source.attrs();
                entries.insert(child.clone(), source);
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child)?,
                    attrs,
                })
            }

            (Opcode::Remove, RequestArgs::Remove { name }) => {
                let child = join(&path, &name);
                let mut entries = self.entries.write();
                match entries.get(&child) {
                    None => return Err(VfsError::NoEnt),
                    Some(Entry::Directory { .. }) => {
                        let prefix = format!("{child}/");
                        if entries.keys().any(|k| k.starts_with(&prefix)) {
                            return Err(VfsError::NotEmpty);
                        }
                    }
                    Some(_) => {}
                }
                entries.remove(&child);
                Ok(RequestResult::Unit)
            }

            (Opcode::Rename, RequestArgs::Rename { src_name, dst_name }) => {
                let dst_parent_path = match &request.secondary {
                    Some(secondary) => path_of(secondary),
                    None => path.clone(),
                };
                let src = join(&path, &src_name);
                let dst = join(&dst_parent_path, &dst_name);
                let mut entries = self.entries.write();
                if !entries.contains_key(&src) {
                    return Err(VfsError::NoEnt);
                }
                let moving = entries.remove(&src).unwrap();
                let is_dir = matches!(moving, Entry::Directory { .. });
                entries.insert(dst.clone(), moving);

                if is_dir {
                    let prefix = format!("{src}/");
                    let children: Vec<String> = entries
                        .keys()
                        .filter(|k| k.starts_with(&prefix))
                        .cloned()
                        .collect();
                    for child in children {
                        let rest = child.strip_prefix(&prefix).unwrap();
                        let new_key = format!("{dst}/{rest}");
                        let value = entries.remove(&child).unwrap();
                        entries.insert(new_key, value);
                    }
                }
                Ok(RequestResult::Unit)
            }

            (Opcode::Open, RequestArgs::Open { create, exclusive, .. }) => {
                let mut entries = self.entries.write();
                match entries.get(&path) {
                    Some(_) if exclusive && create => Err(VfsError::Exist),
                    Some(_) => Ok(RequestResult::Unit),
                    None if create => {
                        entries.insert(
                            path.clone(),
                            Entry::File {
                                data: Vec::new(),
                                attrs: file_attrs(0o644, 0),
                            },
                        );
                        Ok(RequestResult::Unit)
                    }
                    None => Err(VfsError::NoEnt),
                }
            }

            (Opcode::Close, RequestArgs::Close) => Ok(RequestResult::Unit),

            (Opcode::Read, RequestArgs::Read { offset, length }) => {
                let entries = self.entries.read();
                match entries.get(&path) {
                    Some(Entry::File { data, .. }) => {
                        let offset = offset as usize;
                        if offset >= data.len() {
                            return Ok(RequestResult::Read { data: Vec::new(), eof: true });
                        }
                        let end = (offset + length as usize).min(data.len());
                        let slice = data[offset..end].to_vec();
                        let eof = end >= data.len();
                        Ok(RequestResult::Read { data: slice, eof })
                    }
                    Some(_) => Err(VfsError::IsDir),
                    None => Err(VfsError::NoEnt),
                }
            }

            (Opcode::Write, RequestArgs::Write { offset, mut data }) => {
                let mut entries = self.entries.write();
                match entries.get_mut(&path) {
                    Some(Entry::File { data: file_data, attrs }) => {
                        let bytes = data.peek_all();
                        let offset = offset as usize;
                        if file_data.len() < offset + bytes.len() {
                            file_data.resize(offset + bytes.len(), 0);
                        }
                        file_data[offset..offset + bytes.len()].copy_from_slice(&bytes);
                        attrs.size = Some(file_data.len() as u64);
                        attrs.mtime = Some(SystemTime::now());
                        Ok(RequestResult::Write { written: bytes.len() as u32 })
                    }
                    Some(_) => Err(VfsError::IsDir),
                    None => Err(VfsError::NoEnt),
                }
            }

            (Opcode::Commit, RequestArgs::Commit { .. }) => Ok(RequestResult::Unit),

            (Opcode::Readdir, RequestArgs::Readdir { cookie, max_entries }) => {
                let entries = self.entries.read();
                if path.is_empty() {
                    // root always exists
                } else if !matches!(entries.get(&path), Some(Entry::Directory { .. })) {
                    return Err(VfsError::NotDir);
                }

                let mut children: Vec<(String, Entry)> = entries
                    .iter()
                    .filter(|(key, _)| {
                        let parent = key.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                        parent == path && **key != path
                    })
                    .map(|(key, entry)| (key.clone(), entry.clone()))
                    .collect();
                children.sort_by(|(a, _), (b, _)| a.cmp(b));

                let dir_entries: Vec<DirEntry> = children
                    .iter()
                    .enumerate()
                    .skip(cookie as usize)
                    .take(max_entries.max(1) as usize)
                    .map(|(i, (key, entry))| DirEntry {
                        name: key.rsplit('/').next().unwrap_or(key.as_str()).to_string(),
                        inode: i as u64 + 1,
                        kind: entry.kind(),
                        attrs: Some(entry.attrs()),
                        cookie: i as u64 + 1,
                    })
                    .collect();
                let eof = cookie as usize + dir_entries.len() >= children.len();
                Ok(RequestResult::Readdir { entries: dir_entries, eof })
            }

            (Opcode::StatFs, RequestArgs::StatFs) => Ok(RequestResult::StatFs {
                stat: StatFs::default(),
            }),

            _ => Err(VfsError::Inval),
        }
    }
}

fn apply_setattr(entry: &mut Entry, setattr: &SetAttrs) {
    let attrs = match entry {
        Entry::File { attrs, .. } => attrs,
        Entry::Directory { attrs } => attrs,
        Entry::Symlink { attrs, .. } => attrs,
    };
    if let Some(mode) = setattr.mode {
        attrs.mode = Some(mode);
    }
    if let Some(uid) = setattr.uid {
        attrs.uid = Some(uid);
    }
    if let Some(gid) = setattr.gid {
        attrs.gid = Some(gid);
    }
    if let Some(atime) = setattr.atime {
        attrs.atime = Some(atime);
    }
    if let Some(mtime) = setattr.mtime {
        attrs.mtime = Some(mtime);
    }
    if let Some(size) = setattr.size {
        attrs.size = Some(size);
        if let Entry::File { data, .. } = entry {
            data.resize(size as usize, 0);
        }
    }
}

#[async_trait]
impl KvStore for MemfsBackend {
    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> VfsResult<()> {
        let path = format!(".kv/{}", hex::encode(&key));
        let mut entries = self.entries.write();
        entries.insert(
            path,
            Entry::File {
                data: value,
                attrs: file_attrs(0o600, 0),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> VfsResult<Vec<u8>> {
        let path = format!(".kv/{}", hex::encode(key));
        let entries = self.entries.read();
        match entries.get(&path) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            _ => Err(VfsError::NoEnt),
        }
    }

    async fn delete(&self, key: &[u8]) -> VfsResult<()> {
        let path = format!(".kv/{}", hex::encode(key));
        self.entries.write().remove(&path).map(|_| ()).ok_or(VfsError::NoEnt)
    }

    async fn search(
        &self,
        low: &[u8],
        high: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> VfsResult<usize> {
        let entries = self.entries.read();
        let mut keys: Vec<Vec<u8>> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(".kv/").and_then(|h| hex::decode(h).ok()))
            .collect();
        keys.sort();

        let mut count = 0;
        for key in keys {
            if key.as_slice() < low {
                continue;
            }
            if let Some(high) = high {
                if key.as_slice() >= high {
                    break;
                }
            }
            let path = format!(".kv/{}", hex::encode(&key));
            if let Some(Entry::File { data, .. }) = entries.get(&path) {
                count += 1;
                if !visit(&key, data) {
                    break;
                }
            }
        }
        Ok(count)
    }
}
