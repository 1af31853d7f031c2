//! Daemon configuration knobs.
//!
//! Bootstrap, CLI parsing, and config-file loading are out of scope
//! (`spec.md` Non-goals); this module only defines the typed
//! configuration surface a caller assembling a [`crate::verbs::Vfs`]
//! populates, plus mount-option string parsing.

use std::time::Duration;

use tracing::warn;

use crate::mount::MountOptions;

/// Tunables governing thread counts, timeouts, and cache sizing.
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Number of VFS core threads (`spec.md` §4.5's per-thread
    /// cooperative event loops).
    pub core_threads: usize,
    /// Size of the bounded delegation (blocking-work) pool.
    pub delegation_threads: usize,
    /// How often the watchdog tick runs.
    pub watchdog_period: Duration,
    /// How long an open-file-cache entry may sit unreferenced before
    /// the watchdog reclaims it.
    pub idle_close_timeout: Duration,
    /// Soft cap on simultaneously open handles; informational only in
    /// this workspace (no backpressure is implemented against it).
    pub max_open_files: usize,
    /// TTL for user-cache entries.
    pub user_cache_ttl: Duration,
    /// Per-request deadline the dispatcher enforces.
    pub request_timeout: Duration,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            core_threads: 4,
            delegation_threads: 32,
            watchdog_period: Duration::from_secs(1),
            idle_close_timeout: Duration::from_secs(300),
            max_open_files: 8192,
            user_cache_ttl: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Parse an NFS-style mount-options string: comma-separated `key` or
/// `key=value` pairs (`"vers=4,proto=tcp,port=2049,ro"`). Unknown keys
/// are accepted and logged at `warn` rather than rejected, matching
/// the specification's forward-compatibility resolution for mount
/// options the current build doesn't recognize.
pub fn parse_mount_options(raw: &str) -> MountOptions {
    let mut options = MountOptions::default();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (part, None),
        };
        match key {
            "ro" => options.read_only = true,
            "rw" => options.read_only = false,
            "vers" => options.version = value.map(str::to_string),
            "proto" => options.proto = value.map(str::to_string),
            "port" => options.port = value.and_then(|v| v.parse().ok()),
            other => {
                warn!(key = other, "unrecognized mount option, accepting anyway");
                options
                    .extra
                    .insert(other.to_string(), value.unwrap_or("").to_string());
            }
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let options = parse_mount_options("vers=4,proto=tcp,port=2049,ro");
        assert_eq!(options.version.as_deref(), Some("4"));
        assert_eq!(options.proto.as_deref(), Some("tcp"));
        assert_eq!(options.port, Some(2049));
        assert!(options.read_only);
    }

    #[test]
    fn unknown_keys_are_accepted_into_extra() {
        let options = parse_mount_options("frobnicate=yes");
        assert_eq!(options.extra.get("frobnicate").map(String::as_str), Some("yes"));
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = VfsConfig::default();
        assert_eq!(config.watchdog_period, Duration::from_secs(1));
        assert_eq!(config.delegation_threads, 32);
    }
}
