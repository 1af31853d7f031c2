//! Host filesystem passthrough backend.
//!
//! Grounded on `vfs/backends/local.rs`'s `LocalBackend`: every handle's
//! payload carries a path relative to a configured root directory,
//! resolved and canonicalized on every access so a `..`-laden payload
//! can never escape the root.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chimera_vfs_types::{
    AttrMask, Attrs, DirEntry, FileHandle, FileType, ModuleTag, MountId, StatFs, VfsError, VfsResult,
};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::module::{Capabilities, ThreadState, VfsModule};
use crate::request::{Opcode, Request, RequestArgs, RequestResult};

/// Linux `ENOTEMPTY`. `std::io::ErrorKind` has no portable variant for
/// this, so the raw errno is checked directly; the backend targets
/// Linux hosts, matching the rest of the daemon.
const ENOTEMPTY: i32 = 39;

fn io_err(err: std::io::Error) -> VfsError {
    if err.raw_os_error() == Some(ENOTEMPTY) {
        return VfsError::NotEmpty;
    }
    match err.kind() {
        std::io::ErrorKind::NotFound => VfsError::NoEnt,
        std::io::ErrorKind::AlreadyExists => VfsError::Exist,
        std::io::ErrorKind::PermissionDenied => VfsError::Access,
        _ => VfsError::Io,
    }
}

fn path_of(handle: &FileHandle) -> String {
    String::from_utf8_lossy(handle.payload()).into_owned()
}

fn handle_for(mount_id: MountId, path: &str) -> VfsResult<FileHandle> {
    FileHandle::new(mount_id, ModuleTag::Linux, path.as_bytes().to_vec()).ok_or(VfsError::NameTooLong)
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn metadata_to_attrs(meta: &std::fs::Metadata) -> Attrs {
    let kind = if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::Regular
    };
    Attrs {
        mask: AttrMask::common(),
        kind: Some(kind),
        mode: Some(meta.permissions().mode()),
        nlink: Some(meta.nlink() as u32),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        size: Some(meta.len()),
        atime: meta.accessed().ok(),
        mtime: meta.modified().ok(),
        ctime: Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.ctime() as u64)),
        ..Default::default()
    }
}

/// Real-filesystem backend rooted at a configured host directory.
pub struct HostfsBackend {
    root: PathBuf,
    read_only: bool,
}

impl HostfsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root: root.canonicalize().unwrap_or(root),
            read_only: false,
        }
    }

    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        let mut backend = Self::new(root);
        backend.read_only = true;
        backend
    }

    /// Resolve a mount-relative path to an absolute host path, refusing
    /// anything that would escape `root`.
    fn resolve(&self, relative: &str) -> VfsResult<PathBuf> {
        if relative.is_empty() {
            return Ok(self.root.clone());
        }
        let joined = self.root.join(relative);
        let parent = joined.parent().ok_or(VfsError::Inval)?;
        let canonical_parent = if parent.exists() {
            parent.canonicalize().map_err(io_err)?
        } else {
            return Err(VfsError::NoEnt);
        };
        if !canonical_parent.starts_with(&self.root) {
            return Err(VfsError::Perm);
        }
        let file_name = joined.file_name().ok_or(VfsError::Inval)?;
        Ok(canonical_parent.join(file_name))
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::Rofs)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VfsModule for HostfsBackend {
    fn tag(&self) -> ModuleTag {
        ModuleTag::Linux
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_open_for_io: false,
            honors_fsync: true,
            ..Default::default()
        }
    }

    async fn dispatch(&self, _thread: ThreadState, request: Request) -> VfsResult<RequestResult> {
        let mount_id = request.primary.mount_id();
        let path = path_of(&request.primary);
        let full = self.resolve(&path)?;

        match (request.opcode, request.args) {
            (Opcode::GetAttr, RequestArgs::GetAttr { .. }) => {
                let meta = fs::symlink_metadata(&full).await.map_err(io_err)?;
                Ok(RequestResult::Attr { attrs: metadata_to_attrs(&meta) })
            }

            (Opcode::SetAttr, RequestArgs::SetAttr { attrs }) => {
                self.check_writable()?;
                if let Some(mode) = attrs.mode {
                    fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))
                        .await
                        .map_err(io_err)?;
                }
                if let Some(size) = attrs.size {
                    let file = fs::OpenOptions::new().write(true).open(&full).await.map_err(io_err)?;
                    file.set_len(size).await.map_err(io_err)?;
                }
                let meta = fs::symlink_metadata(&full).await.map_err(io_err)?;
                Ok(RequestResult::Attr { attrs: metadata_to_attrs(&meta) })
            }

            (Opcode::Lookup, RequestArgs::Lookup { name, .. }) => {
                let child_path = join(&path, &name);
                let child_full = self.resolve(&child_path)?;
                let meta = fs::symlink_metadata(&child_full).await.map_err(io_err)?;
                Ok(RequestResult::Lookup {
                    handle: handle_for(mount_id, &child_path)?,
                    attrs: metadata_to_attrs(&meta),
                })
            }

            (Opcode::Mkdir, RequestArgs::Mkdir { name, mode }) => {
                self.check_writable()?;
                let child_path = join(&path, &name);
                let child_full = self.resolve(&child_path)?;
                fs::create_dir(&child_full).await.map_err(io_err)?;
                fs::set_permissions(&child_full, std::fs::Permissions::from_mode(mode))
                    .await
                    .map_err(io_err)?;
                let meta = fs::symlink_metadata(&child_full).await.map_err(io_err)?;
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child_path)?,
                    attrs: metadata_to_attrs(&meta),
                })
            }

            (Opcode::Mknod, RequestArgs::Mknod { name, mode, .. }) => {
                self.check_writable()?;
                let child_path = join(&path, &name);
                let child_full = self.resolve(&child_path)?;
                let file = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&child_full)
                    .await
                    .map_err(io_err)?;
                file.set_permissions(std::fs::Permissions::from_mode(mode))
                    .await
                    .map_err(io_err)?;
                let meta = fs::symlink_metadata(&child_full).await.map_err(io_err)?;
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child_path)?,
                    attrs: metadata_to_attrs(&meta),
                })
            }

            (Opcode::Symlink, RequestArgs::Symlink { name, target }) => {
                self.check_writable()?;
                let child_path = join(&path, &name);
                let child_full = self.resolve(&child_path)?;
                fs::symlink(&target, &child_full).await.map_err(io_err)?;
                let meta = fs::symlink_metadata(&child_full).await.map_err(io_err)?;
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child_path)?,
                    attrs: metadata_to_attrs(&meta),
                })
            }

            (Opcode::Readlink, RequestArgs::Readlink) => {
                let target = fs::read_link(&full).await.map_err(io_err)?;
                Ok(RequestResult::Readlink {
                    target: target.to_string_lossy().into_owned(),
                })
            }

            (Opcode::Link, RequestArgs::Link { new_name }) => {
                self.check_writable()?;
                let secondary = request.secondary.ok_or(VfsError::Inval)?;
                let new_parent = path_of(&secondary);
                let child_path = join(&new_parent, &new_name);
                let child_full = self.resolve(&child_path)?;
                fs::hard_link(&full, &child_full).await.map_err(io_err)?;
                let meta = fs::symlink_metadata(&child_full).await.map_err(io_err)?;
                Ok(RequestResult::Created {
                    handle: handle_for(mount_id, &child_path)?,
                    attrs: metadata_to_attrs(&meta),
                })
            }

            (Opcode::Remove, RequestArgs::Remove { name }) => {
                self.check_writable()?;
                let child_path = join(&path, &name);
                let child_full = self.resolve(&child_path)?;
                let meta = fs::symlink_metadata(&child_full).await.map_err(io_err)?;
                if meta.is_dir() {
                    fs::remove_dir(&child_full).await.map_err(io_err)?;
                } else {
                    fs::remove_file(&child_full).await.map_err(io_err)?;
                }
                Ok(RequestResult::Unit)
            }

            (Opcode::Rename, RequestArgs::Rename { src_name, dst_name }) => {
                self.check_writable()?;
                let dst_parent = match &request.secondary {
                    Some(secondary) => path_of(secondary),
                    None => path.clone(),
                };
                let src_full = self.resolve(&join(&path, &src_name))?;
                let dst_full = self.resolve(&join(&dst_parent, &dst_name))?;
                fs::rename(&src_full, &dst_full).await.map_err(io_err)?;
                Ok(RequestResult::Unit)
            }

            (Opcode::Open, RequestArgs::Open { create, truncate, exclusive }) => {
                if create {
                    self.check_writable()?;
                    let mut options = fs::OpenOptions::new();
                    options.write(true).create(true);
                    if exclusive {
                        options.create_new(true);
                    }
                    if truncate {
                        options.truncate(true);
                    }
                    options.open(&full).await.map_err(io_err)?;
                } else {
                    fs::symlink_metadata(&full).await.map_err(io_err)?;
                }
                Ok(RequestResult::Unit)
            }

            (Opcode::Close, RequestArgs::Close) => Ok(RequestResult::Unit),

            (Opcode::Read, RequestArgs::Read { offset, length }) => {
                let mut file = fs::File::open(&full).await.map_err(io_err)?;
                file.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_err)?;
                let mut buf = vec![0u8; length as usize];
                let mut total = 0;
                loop {
                    let read = file.read(&mut buf[total..]).await.map_err(io_err)?;
                    if read == 0 {
                        break;
                    }
                    total += read;
                    if total == buf.len() {
                        break;
                    }
                }
                buf.truncate(total);
                let eof = total < length as usize;
                Ok(RequestResult::Read { data: buf, eof })
            }

            (Opcode::Write, RequestArgs::Write { offset, data }) => {
                self.check_writable()?;
                let bytes = data.peek_all();
                let mut file = fs::OpenOptions::new().write(true).open(&full).await.map_err(io_err)?;
                file.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_err)?;
                file.write_all(&bytes).await.map_err(io_err)?;
                Ok(RequestResult::Write { written: bytes.len() as u32 })
            }

            (Opcode::Commit, RequestArgs::Commit { .. }) => {
                let file = fs::OpenOptions::new().write(true).open(&full).await.map_err(io_err)?;
                file.sync_all().await.map_err(io_err)?;
                Ok(RequestResult::Unit)
            }

            (Opcode::Readdir, RequestArgs::Readdir { cookie, max_entries }) => {
                let mut names = Vec::new();
                let mut dir = fs::read_dir(&full).await.map_err(io_err)?;
                while let Some(dir_entry) = dir.next_entry().await.map_err(io_err)? {
                    names.push(dir_entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();

                let mut entries = Vec::new();
                for (i, name) in names
                    .iter()
                    .enumerate()
                    .skip(cookie as usize)
                    .take(max_entries.max(1) as usize)
                {
                    let meta = fs::symlink_metadata(full.join(name)).await.map_err(io_err)?;
                    entries.push(DirEntry {
                        name: name.clone(),
                        inode: meta.ino(),
                        kind: if meta.is_dir() {
                            FileType::Directory
                        } else if meta.file_type().is_symlink() {
                            FileType::Symlink
                        } else {
                            FileType::Regular
                        },
                        attrs: Some(metadata_to_attrs(&meta)),
                        cookie: i as u64 + 1,
                    });
                }
                let eof = cookie as usize + entries.len() >= names.len();
                Ok(RequestResult::Readdir { entries, eof })
            }

            (Opcode::StatFs, RequestArgs::StatFs) => Ok(RequestResult::StatFs {
                stat: StatFs::default(),
            }),

            _ => Err(VfsError::Inval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimera_vfs_types::{Credential, IoVecCursor};
    use std::time::Duration;
    use tempfile::tempdir;

    fn handle(path: &str) -> FileHandle {
        FileHandle::new(MountId(1), ModuleTag::Linux, path.as_bytes().to_vec()).unwrap()
    }

    fn request(opcode: Opcode, primary: FileHandle, secondary: Option<FileHandle>, args: RequestArgs) -> Request {
        Request::new(
            1,
            opcode,
            Credential::anonymous(),
            primary,
            secondary,
            args,
            tokio::time::Instant::now() + Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn mknod_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let backend = HostfsBackend::new(dir.path());

        backend
            .dispatch(
                std::sync::Arc::new(()),
                request(
                    Opcode::Mknod,
                    handle(""),
                    None,
                    RequestArgs::Mknod { name: "f.txt".into(), mode: 0o644, rdev: 0 },
                ),
            )
            .await
            .unwrap();

        backend
            .dispatch(
                std::sync::Arc::new(()),
                request(
                    Opcode::Write,
                    handle("f.txt"),
                    None,
                    RequestArgs::Write { offset: 0, data: IoVecCursor::from_slice(b"payload") },
                ),
            )
            .await
            .unwrap();

        let result = backend
            .dispatch(
                std::sync::Arc::new(()),
                request(Opcode::Read, handle("f.txt"), None, RequestArgs::Read { offset: 0, length: 7 }),
            )
            .await
            .unwrap();
        match result {
            RequestResult::Read { data, .. } => assert_eq!(data, b"payload"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let dir = tempdir().unwrap();
        let backend = HostfsBackend::new(dir.path());
        let err = backend
            .dispatch(
                std::sync::Arc::new(()),
                request(
                    Opcode::GetAttr,
                    handle("../../etc/passwd"),
                    None,
                    RequestArgs::GetAttr { mask: AttrMask::common() },
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::Perm | VfsError::NoEnt));
    }

    #[tokio::test]
    async fn read_only_backend_rejects_mkdir() {
        let dir = tempdir().unwrap();
        let backend = HostfsBackend::read_only(dir.path());
        let err = backend
            .dispatch(
                std::sync::Arc::new(()),
                request(Opcode::Mkdir, handle(""), None, RequestArgs::Mkdir { name: "d".into(), mode: 0o755 }),
            )
            .await
            .unwrap_err();
        assert_eq!(err, VfsError::Rofs);
    }
}
