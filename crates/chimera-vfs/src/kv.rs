//! Generic key-value facility, optionally exposed by a backend module.
//!
//! `spec.md` describes a `put`/`get`/`delete`/`search` surface that one
//! designated backend provides; operations are forwarded to it
//! directly rather than riding through the opcode [`crate::request`]
//! union, since a range scan's early-stop callback doesn't fit a plain
//! request/response shape.

use async_trait::async_trait;
use chimera_vfs_types::VfsResult;

/// One key/value pair returned by [`KvStore::search`].
pub type KvEntry = (Vec<u8>, Vec<u8>);

/// The key-value surface a backend may implement. `memfs` implements
/// this; `hostfs` does not, since a host directory tree has no natural
/// binary-key namespace.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> VfsResult<()>;

    async fn get(&self, key: &[u8]) -> VfsResult<Vec<u8>>;

    async fn delete(&self, key: &[u8]) -> VfsResult<()>;

    /// Half-open range scan `[low, high)`, stopping early the first
    /// time `visit` returns `false`. `high: None` scans to the end of
    /// the key space. Returns the number of entries visited.
    async fn search(
        &self,
        low: &[u8],
        high: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> VfsResult<usize>;
}
