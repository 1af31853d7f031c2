//! File handle: the opaque byte-string identifier of a filesystem object.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::hash::fingerprint64;

/// Maximum on-wire length of a file handle, in bytes.
pub const FH_MAX_LEN: usize = 64;

/// Offset of the module tag byte within the handle's byte image.
const MODULE_TAG_OFFSET: usize = 16;

/// Maximum length of the backend-opaque payload (`FH_MAX_LEN` minus the
/// 16-byte mount id and the 1-byte module tag).
pub const FH_MAX_PAYLOAD_LEN: usize = FH_MAX_LEN - MODULE_TAG_OFFSET - 1;

/// The backend module that owns an object, encoded as the wire-stable
/// discriminant byte at offset 16 of a file handle.
///
/// Dynamically loaded shared objects are a C-ism; here the set of
/// modules is statically known and dispatch is a match on this enum,
/// per the REDESIGN FLAG in the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ModuleTag {
    /// The synthetic read-only pseudo-filesystem whose directory is the
    /// set of mounts.
    Root = 0,
    /// In-memory filesystem.
    Memfs = 1,
    /// Host filesystem passthrough.
    Linux = 2,
    /// io_uring direct-device backend.
    IoUring = 3,
    /// Demo/log-structured backend.
    Demofs = 4,
    /// Cairn log-structured backend.
    Cairn = 5,
    /// NFS client backend (re-exporting a remote NFS share).
    Nfs = 6,
}

impl ModuleTag {
    /// Decode a module tag from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Root),
            1 => Some(Self::Memfs),
            2 => Some(Self::Linux),
            3 => Some(Self::IoUring),
            4 => Some(Self::Demofs),
            5 => Some(Self::Cairn),
            6 => Some(Self::Nfs),
            _ => None,
        }
    }

    /// The wire byte for this tag.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Root => "root",
            Self::Memfs => "memfs",
            Self::Linux => "linux",
            Self::IoUring => "io_uring",
            Self::Demofs => "demofs",
            Self::Cairn => "cairn",
            Self::Nfs => "nfs",
        };
        f.write_str(name)
    }
}

/// 128-bit stable identifier of a mount, derived from `hash128(mount_path)`.
///
/// `MountId::ROOT` (all zero bits) is reserved for the root pseudo-mount
/// and is addressable by every thread without a mount-tree lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(pub u128);

impl MountId {
    /// The mount id of the root pseudo-mount.
    pub const ROOT: MountId = MountId(0);

    /// Derive a mount id from a client-visible path.
    pub fn derive(client_path: &str) -> Self {
        Self(crate::hash::fingerprint128(client_path.as_bytes()))
    }

    /// Returns true if this is the root pseudo-mount's id.
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

/// An opaque, self-describing handle identifying both the backend
/// module that owns an object and the object within it.
///
/// Handles are value objects: equality is byte-wise, hashing is the
/// 64-bit fingerprint of the full byte string. A handle never contains
/// a pointer.
///
/// Wire layout:
/// ```text
/// [0..16)  mount_id       : 128-bit, network byte order
/// [16]     module_tag     : 1 byte
/// [17..N)  backend_payload: opaque, up to FH_MAX_PAYLOAD_LEN bytes
/// ```
#[derive(Debug, Clone, Eq)]
pub struct FileHandle {
    mount_id: MountId,
    module_tag: ModuleTag,
    payload: Vec<u8>,
}

impl FileHandle {
    /// Construct a handle from its logical parts.
    ///
    /// Returns `None` if `payload` would overflow the 64-byte wire
    /// budget.
    pub fn new(mount_id: MountId, module_tag: ModuleTag, payload: Vec<u8>) -> Option<Self> {
        if payload.len() > FH_MAX_PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            mount_id,
            module_tag,
            payload,
        })
    }

    /// The special root handle: `mount_id = 0`, `module_tag = Root`,
    /// empty payload. Addressable by all threads without any lookup.
    pub fn root() -> Self {
        Self {
            mount_id: MountId::ROOT,
            module_tag: ModuleTag::Root,
            payload: Vec::new(),
        }
    }

    /// Returns true if this is the root handle.
    pub fn is_root(&self) -> bool {
        self.module_tag == ModuleTag::Root && self.mount_id.is_root()
    }

    /// The mount this handle belongs to.
    pub fn mount_id(&self) -> MountId {
        self.mount_id
    }

    /// The backend module that owns this handle.
    pub fn module_tag(&self) -> ModuleTag {
        self.module_tag
    }

    /// The backend-opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to the 2-64 byte wire image.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MODULE_TAG_OFFSET + 1 + self.payload.len());
        buf.extend_from_slice(&self.mount_id.0.to_be_bytes());
        buf.push(self.module_tag.as_byte());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a wire image produced by [`FileHandle::to_wire`].
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MODULE_TAG_OFFSET + 1 || bytes.len() > FH_MAX_LEN {
            return None;
        }
        let mut mount_bytes = [0u8; 16];
        mount_bytes.copy_from_slice(&bytes[0..16]);
        let mount_id = MountId(u128::from_be_bytes(mount_bytes));
        let module_tag = ModuleTag::from_byte(bytes[16])?;
        let payload = bytes[17..].to_vec();
        Some(Self {
            mount_id,
            module_tag,
            payload,
        })
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.mount_id == other.mount_id
            && self.module_tag == other.module_tag
            && self.payload == other.payload
    }
}

impl Hash for FileHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fingerprint64(&self.to_wire()).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_handle_is_well_known() {
        let root = FileHandle::root();
        assert!(root.is_root());
        assert_eq!(root.mount_id(), MountId::ROOT);
        assert_eq!(root.module_tag(), ModuleTag::Root);
    }

    #[test]
    fn wire_round_trip() {
        let handle = FileHandle::new(
            MountId::derive("/memfs"),
            ModuleTag::Memfs,
            vec![1, 2, 3, 4],
        )
        .unwrap();
        let wire = handle.to_wire();
        assert!(wire.len() <= FH_MAX_LEN);
        let parsed = FileHandle::from_wire(&wire).unwrap();
        assert_eq!(handle, parsed);
    }

    #[test]
    fn payload_overflow_rejected() {
        let huge = vec![0u8; FH_MAX_PAYLOAD_LEN + 1];
        assert!(FileHandle::new(MountId::ROOT, ModuleTag::Memfs, huge).is_none());
    }

    #[test]
    fn equality_is_byte_wise() {
        let a = FileHandle::new(MountId(1), ModuleTag::Memfs, vec![9]).unwrap();
        let b = FileHandle::new(MountId(1), ModuleTag::Memfs, vec![9]).unwrap();
        let c = FileHandle::new(MountId(2), ModuleTag::Memfs, vec![9]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn module_tag_wire_byte_round_trips() {
        for tag in [
            ModuleTag::Root,
            ModuleTag::Memfs,
            ModuleTag::Linux,
            ModuleTag::IoUring,
            ModuleTag::Demofs,
            ModuleTag::Cairn,
            ModuleTag::Nfs,
        ] {
            assert_eq!(ModuleTag::from_byte(tag.as_byte()), Some(tag));
        }
        assert_eq!(ModuleTag::from_byte(200), None);
    }
}
