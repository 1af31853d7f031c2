//! Chimera-NAS's VFS indirection core: mount tree, file-handle
//! namespace, open-file cache, request dispatcher, delegation pool,
//! user/credential cache, and key-value facility.
//!
//! Protocol front-ends, wire codecs, and on-disk backend formats live
//! outside this crate; it implements only the indirection layer they
//! plug into, following the module boundaries in `SPEC_FULL.md`.

pub mod backends;
pub mod config;
pub mod delegation;
pub mod kv;
pub mod module;
pub mod mount;
pub mod open_cache;
pub mod request;
pub mod root;
pub mod thread_ctx;
pub mod user_cache;
pub mod verbs;
pub mod watchdog;

pub use chimera_vfs_types::{
    AttrMask, Attrs, Credential, DirEntry, FileHandle, FileType, IoVecCursor, ModuleTag, MountId,
    SetAttrs, StatFs, VfsError, VfsResult,
};
pub use config::VfsConfig;
pub use kv::KvStore;
pub use module::{Capabilities, ModuleRegistry, VfsModule};
pub use mount::{MountOptions, MountTree};
pub use open_cache::OpenFileCache;
pub use request::Dispatcher;
pub use thread_ctx::VfsThreadPool;
pub use verbs::Vfs;
pub use watchdog::Watchdog;
