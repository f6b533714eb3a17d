//! Tracing initialization shared by the SFU binaries.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber, logging to stderr.
///
/// - Respects `RUST_LOG` via `EnvFilter` (default `info`).
/// - ANSI color controlled by `ColorWhen`.
/// - The module target is kept so publisher and listener stages can be
///   filtered separately, e.g. `RUST_LOG=publisher::jitter_buffer=debug`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(color.should_color_stderr())
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
