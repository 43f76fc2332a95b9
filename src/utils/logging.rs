//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; embedding applications and
//! tests call [`init_tracing`] once to get formatted output filtered by
//! `RUST_LOG`.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Install a global fmt subscriber with an env filter.
///
/// `default_level` is added as a directive on top of `RUST_LOG`. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(default_level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Internal(format!("tracing init failed: {}", e)))
}

/// Like [`init_tracing`], but ignores an already-installed subscriber.
///
/// Meant for test harnesses where several tests race to initialize.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(Level::DEBUG))
        .with_test_writer()
        .try_init();
}

fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(default_level.into())
}
