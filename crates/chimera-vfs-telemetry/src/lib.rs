//! Structured logging init for the VFS core.
//!
//! The daemon that embeds this core is expected to call [`init`] exactly
//! once at startup, before any VFS thread or the delegation pool is
//! spun up — the "confine global mutable state to a single
//! initialization step" design rule applies to the process-wide log
//! level here just as it does to the rest of the daemon's bootstrap.
//!
//! Scoped down from the teacher's `kaijutsu-telemetry`, which also
//! injects W3C trace context across a Cap'n Proto RPC boundary; that
//! machinery belongs to the (out-of-scope) wire protocol layer, not the
//! VFS core, so only the subscriber wiring is kept here.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber from `RUST_LOG` (default
/// `info`). Idempotent: a second call is a no-op rather than a panic,
/// since unit tests in downstream crates may each try to initialize
/// logging independently.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
