//! Tracing setup.
//!
//! A thin wrapper around `tracing_subscriber`'s env-filter builder, in the style this codebase's
//! own JS-runtime module reaches for: callers opt in explicitly rather than the library installing
//! a global subscriber as a side effect of being linked in.

use tracing_subscriber::EnvFilter;

/// Installs a process-wide `tracing` subscriber honoring `RUST_LOG` (defaulting to `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
