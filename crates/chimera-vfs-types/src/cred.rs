//! VFS credential: a uniform `(uid, gid, supplementary-gids, flavor)` tuple.
//!
//! Grounded on `vfs_cred.h`: the flavor enumeration allows future
//! extension beyond UNIX-style credentials, but only `Unix` is
//! implemented here.

/// Maximum number of supplementary groups in a credential, matching the
/// NFS `AUTH_SYS` limit per RFC 1831.
pub const CRED_MAX_GIDS: usize = 16;

/// Well-known anonymous uid/gid, matching the Linux NFS server defaults
/// (`nfsnobody`).
pub const CRED_ANON_UID: u32 = 65534;
pub const CRED_ANON_GID: u32 = 65534;

/// Credential flavor. Only UNIX-style credentials are required by the
/// core; the enum is open for protocol front-ends that authenticate
/// differently (e.g. Kerberos/SMB) to populate the remaining fields and
/// still flow through the same propagation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredFlavor {
    Unix,
}

/// The generic credential representation carried on every request,
/// independent of the protocol front-end that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub flavor: CredFlavor,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl Credential {
    /// Build a UNIX credential, truncating `gids` to `CRED_MAX_GIDS`
    /// entries if it overflows.
    pub fn unix(uid: u32, gid: u32, mut gids: Vec<u32>) -> Self {
        gids.truncate(CRED_MAX_GIDS);
        Self {
            flavor: CredFlavor::Unix,
            uid,
            gid,
            gids,
        }
    }

    /// The anonymous credential used when no identity is established.
    pub fn anonymous() -> Self {
        Self::unix(CRED_ANON_UID, CRED_ANON_GID, Vec::new())
    }

    /// Returns true if `gid` is the primary group or among the
    /// supplementary groups of this credential.
    pub fn is_member(&self, gid: u32) -> bool {
        self.gid == gid || self.gids.contains(&gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_credential_matches_nfs_defaults() {
        let cred = Credential::anonymous();
        assert_eq!(cred.uid, CRED_ANON_UID);
        assert_eq!(cred.gid, CRED_ANON_GID);
        assert!(cred.gids.is_empty());
    }

    #[test]
    fn gids_are_truncated_to_max() {
        let many: Vec<u32> = (0..32).collect();
        let cred = Credential::unix(1000, 1000, many);
        assert_eq!(cred.gids.len(), CRED_MAX_GIDS);
    }

    #[test]
    fn is_member_checks_primary_and_supplementary() {
        let cred = Credential::unix(1000, 100, vec![200, 300]);
        assert!(cred.is_member(100));
        assert!(cred.is_member(200));
        assert!(!cred.is_member(400));
    }
}
