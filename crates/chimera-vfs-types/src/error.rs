//! The observable error enumeration surfaced to protocol front-ends.

use thiserror::Error;

/// Errors surfaced across the VFS core boundary.
///
/// Mirrors `spec.md` §6's enumeration. There is deliberately no `Ok`
/// variant: success is the `Ok(T)` arm of the ordinary `Result` this
/// type participates in as the error half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("operation not permitted")]
    Perm,
    #[error("no such file or directory")]
    NoEnt,
    #[error("I/O error")]
    Io,
    #[error("no such device or address")]
    NxIo,
    #[error("permission denied")]
    Access,
    #[error("file exists")]
    Exist,
    #[error("cross-device link")]
    XDev,
    #[error("no such device")]
    NoDev,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("invalid argument")]
    Inval,
    #[error("file too large")]
    FBig,
    #[error("no space left on device")]
    NoSpc,
    #[error("read-only filesystem")]
    Rofs,
    #[error("too many links")]
    MLink,
    #[error("name too long")]
    NameTooLong,
    #[error("directory not empty")]
    NotEmpty,
    #[error("disk quota exceeded")]
    DQuot,
    #[error("stale file handle")]
    Stale,
    #[error("object is remote")]
    Remote,
    #[error("bad file handle")]
    BadHandle,
    #[error("update synchronization mismatch")]
    NotSync,
    #[error("bad readdir cookie")]
    BadCookie,
    #[error("operation not supported")]
    NotSupp,
    #[error("buffer too small")]
    TooSmall,
    #[error("server fault")]
    ServerFault,
    #[error("type not supported by server")]
    BadType,
    #[error("try again later")]
    Delay,
    #[error("operation timed out")]
    TimedOut,
    #[error("value too large")]
    Overflow,
    #[error("module not loaded")]
    NoModule,
    #[error("resource busy")]
    Busy,
}

/// Convenience alias for the core's fallible operations.
pub type VfsResult<T> = Result<T, VfsError>;
