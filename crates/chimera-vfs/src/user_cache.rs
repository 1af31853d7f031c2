//! User/credential cache: TTL-based, pinnable, bucketed by name, by
//! uid, and by gid membership.
//!
//! Grounded on `vfs_user_cache.h`: entries carry both password-hash
//! fields and an SID alongside the POSIX identity fields, a pinned
//! entry never expires, and removal must be safe for a reader that
//! already holds the entry. The source achieves the last property with
//! an RCU grace period; here ownership does the same job for free —
//! once a caller's `dashmap::mapref::one::Ref` (or, after `.clone()`,
//! an owned `Arc<UserEntry>`) is obtained, the entry stays alive for as
//! long as that reference is held even if a concurrent removal drops
//! it from the map, because Rust's ownership model makes
//! use-after-reclaim impossible by construction.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

/// One cached user record.
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
    pub sid: Option<String>,
    pub unix_password_hash: Option<String>,
    pub smb_password_hash: Option<String>,
    pub pinned: bool,
    expires_at: tokio::time::Instant,
}

impl UserEntry {
    fn is_expired(&self, now: tokio::time::Instant) -> bool {
        !self.pinned && now >= self.expires_at
    }
}

/// Bucketed by name, by uid, and by gid so any of the three lookups
/// avoids a scan. `by_gid` indexes group membership — a gid maps to
/// every uid carrying it either as primary or supplementary — and is
/// kept consistent with `by_uid` on every insert, replace, and remove.
pub struct UserCache {
    by_name: DashMap<String, Arc<UserEntry>>,
    by_uid: DashMap<u32, Arc<UserEntry>>,
    by_gid: DashMap<u32, Vec<u32>>,
    ttl: Duration,
}

impl UserCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_name: DashMap::new(),
            by_uid: DashMap::new(),
            by_gid: DashMap::new(),
            ttl,
        }
    }

    fn gids_of(entry: &UserEntry) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(entry.gid).chain(entry.gids.iter().copied())
    }

    fn index_gids(&self, entry: &UserEntry) {
        for gid in Self::gids_of(entry) {
            let mut uids = self.by_gid.entry(gid).or_default();
            if !uids.contains(&entry.uid) {
                uids.push(entry.uid);
            }
        }
    }

    fn deindex_gids(&self, entry: &UserEntry) {
        for gid in Self::gids_of(entry) {
            if let Some(mut uids) = self.by_gid.get_mut(&gid) {
                uids.retain(|uid| *uid != entry.uid);
                if uids.is_empty() {
                    drop(uids);
                    self.by_gid.remove(&gid);
                }
            }
        }
    }

    /// Insert or replace a user entry. `pinned` entries are exempt from
    /// TTL expiry and from the watchdog's expiry sweep.
    pub fn insert(
        &self,
        name: impl Into<String>,
        uid: u32,
        gid: u32,
        gids: Vec<u32>,
        sid: Option<String>,
        unix_password_hash: Option<String>,
        smb_password_hash: Option<String>,
        pinned: bool,
    ) {
        if let Some((_, old)) = self.by_uid.remove(&uid) {
            self.by_name.remove(&old.name);
            self.deindex_gids(&old);
        }
        let name = name.into();
        let entry = Arc::new(UserEntry {
            name: name.clone(),
            uid,
            gid,
            gids,
            sid,
            unix_password_hash,
            smb_password_hash,
            pinned,
            expires_at: tokio::time::Instant::now() + self.ttl,
        });
        self.index_gids(&entry);
        self.by_name.insert(name, entry.clone());
        self.by_uid.insert(uid, entry);
    }

    /// Pin an already-cached entry (by uid) so it never expires.
    /// Returns `false` if no such uid is cached.
    pub fn pin(&self, uid: u32) -> bool {
        let Some(entry) = self.by_uid.get(&uid).map(|e| e.clone()) else {
            return false;
        };
        let pinned = Arc::new(UserEntry {
            pinned: true,
            ..(*entry).clone()
        });
        self.by_name.insert(pinned.name.clone(), pinned.clone());
        self.by_uid.insert(pinned.uid, pinned);
        true
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<UserEntry>> {
        let now = tokio::time::Instant::now();
        self.by_name.get(name).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.clone())
            }
        })
    }

    pub fn lookup_by_uid(&self, uid: u32) -> Option<Arc<UserEntry>> {
        let now = tokio::time::Instant::now();
        self.by_uid.get(&uid).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.clone())
            }
        })
    }

    /// All cached users carrying `gid`, either as primary gid or in
    /// their supplementary list. Expired, unpinned entries are filtered
    /// out exactly as in [`Self::lookup_by_uid`].
    pub fn lookup_by_gid(&self, gid: u32) -> Vec<Arc<UserEntry>> {
        let Some(uids) = self.by_gid.get(&gid) else {
            return Vec::new();
        };
        uids.iter().filter_map(|uid| self.lookup_by_uid(*uid)).collect()
    }

    /// Whether the cached user `uid` carries `gid`, as primary gid or
    /// supplementary. `false` if `uid` isn't cached (or has expired) —
    /// distinct from [`chimera_vfs_types::Credential::is_member`],
    /// which checks a gid against an already-resolved credential's own
    /// group list rather than consulting this cache.
    pub fn is_member(&self, uid: u32, gid: u32) -> bool {
        match self.lookup_by_uid(uid) {
            Some(entry) => entry.gid == gid || entry.gids.contains(&gid),
            None => false,
        }
    }

    pub fn remove(&self, uid: u32) {
        if let Some((_, entry)) = self.by_uid.remove(&uid) {
            self.by_name.remove(&entry.name);
            self.deindex_gids(&entry);
        }
    }

    /// Sweep both buckets for expired, unpinned entries. Called
    /// periodically by the watchdog (default every 60s); returns the
    /// number of entries reclaimed.
    pub fn sweep_expired(&self) -> usize {
        let now = tokio::time::Instant::now();
        let expired_uids: Vec<u32> = self
            .by_uid
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| *entry.key())
            .collect();
        for uid in &expired_uids {
            self.remove(*uid);
        }
        if !expired_uids.is_empty() {
            debug!(count = expired_uids.len(), "user cache expiry sweep reclaimed entries");
        }
        expired_uids.len()
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_lookup_both_buckets() {
        let cache = UserCache::new(Duration::from_secs(60));
        cache.insert("alice", 1000, 1000, vec![100], None, None, None, false);
        assert_eq!(cache.lookup_by_name("alice").unwrap().uid, 1000);
        assert_eq!(cache.lookup_by_uid(1000).unwrap().name, "alice");
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache = UserCache::new(Duration::from_millis(5));
        cache.insert("bob", 1001, 1001, vec![], None, None, None, false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.lookup_by_uid(1001).is_none());
    }

    #[tokio::test]
    async fn pinned_entry_never_expires() {
        let cache = UserCache::new(Duration::from_millis(5));
        cache.insert("root", 0, 0, vec![], None, None, None, false);
        assert!(cache.pin(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.lookup_by_uid(0).is_some());
    }

    #[tokio::test]
    async fn lookup_by_gid_finds_primary_and_supplementary_members() {
        let cache = UserCache::new(Duration::from_secs(60));
        cache.insert("alice", 1000, 100, vec![200], None, None, None, false);
        cache.insert("bob", 1001, 100, vec![], None, None, None, false);
        cache.insert("carol", 1002, 300, vec![200], None, None, None, false);

        let mut gid100: Vec<u32> = cache.lookup_by_gid(100).iter().map(|e| e.uid).collect();
        gid100.sort();
        assert_eq!(gid100, vec![1000, 1001]);

        let mut gid200: Vec<u32> = cache.lookup_by_gid(200).iter().map(|e| e.uid).collect();
        gid200.sort();
        assert_eq!(gid200, vec![1000, 1002]);

        assert!(cache.lookup_by_gid(999).is_empty());
    }

    #[tokio::test]
    async fn is_member_checks_primary_and_supplementary_gids() {
        let cache = UserCache::new(Duration::from_secs(60));
        cache.insert("alice", 1000, 100, vec![200, 300], None, None, None, false);

        assert!(cache.is_member(1000, 100));
        assert!(cache.is_member(1000, 200));
        assert!(cache.is_member(1000, 300));
        assert!(!cache.is_member(1000, 999));
        assert!(!cache.is_member(9999, 100));
    }

    #[tokio::test]
    async fn reinsert_drops_stale_gid_membership() {
        let cache = UserCache::new(Duration::from_secs(60));
        cache.insert("alice", 1000, 100, vec![200], None, None, None, false);
        assert!(cache.is_member(1000, 200));

        cache.insert("alice", 1000, 100, vec![300], None, None, None, false);
        assert!(!cache.is_member(1000, 200));
        assert!(cache.is_member(1000, 300));
        assert!(cache.lookup_by_gid(200).is_empty());
    }

    #[tokio::test]
    async fn remove_drops_gid_membership() {
        let cache = UserCache::new(Duration::from_secs(60));
        cache.insert("alice", 1000, 100, vec![200], None, None, None, false);
        cache.remove(1000);
        assert!(cache.lookup_by_gid(100).is_empty());
        assert!(cache.lookup_by_gid(200).is_empty());
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_unpinned() {
        let cache = UserCache::new(Duration::from_millis(5));
        cache.insert("short", 1, 1, vec![], None, None, None, false);
        cache.insert("forever", 2, 2, vec![], None, None, None, true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reclaimed = cache.sweep_expired();
        assert_eq!(reclaimed, 1);
        assert!(cache.lookup_by_uid(1).is_none());
        assert!(cache.lookup_by_uid(2).is_some());
    }
}
