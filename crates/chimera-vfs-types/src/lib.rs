//! Wire-level types shared by the VFS core and every backend module:
//! file handles, credentials, attributes, the error enumeration, the
//! stable-hash primitives, and the scatter/gather I/O-vector cursor.
//!
//! This crate intentionally depends on no async runtime so that a
//! backend crate that wants these types without pulling in `tokio`
//! (e.g. a pure computation over cached attributes) can do so.

mod attrs;
mod cred;
mod error;
mod handle;
pub mod hash;
mod iovec;

pub use attrs::{AttrMask, Attrs, DirEntry, FileType, SetAttrs, StatFs};
pub use cred::{CredFlavor, Credential, CRED_ANON_GID, CRED_ANON_UID, CRED_MAX_GIDS};
pub use error::{VfsError, VfsResult};
pub use handle::{FileHandle, ModuleTag, MountId, FH_MAX_LEN, FH_MAX_PAYLOAD_LEN};
pub use iovec::{IoSegment, IoVecCursor};
