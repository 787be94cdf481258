//! `tracing` logger setup shared by the harness and the test server.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize the global `tracing` logger.
///
/// + Events print to stderr, so logs never interleave with the report the
///   harness writes to stdout.
/// + The default level is INFO; set `RUST_LOG` to change the level or
///   filter by module.
///
/// Panics if a logger is already initialized.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Logger init for tests: a no-op unless `RUST_LOG` is set, and it never
/// panics, since parallel test threads race to install the global logger.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Try to initialize the global logger. Returns an `Err` if another global
/// logger is already set.
pub fn try_init() -> Result<(), TryInitError> {
    // Default to INFO if `RUST_LOG` is unset or doesn't parse.
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directives| Targets::from_str(&directives).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let stderr_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        // Two small binaries; module targets are noise here.
        .with_target(false)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stderr_log).try_init()
}
