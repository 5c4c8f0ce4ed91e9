//! Logging utilities for pimsync. Logs go to stderr so that rendered plans
//! on stdout stay clean.
//!

// Re-exports for convenience
pub use tracing::metadata::LevelFilter;
pub use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{util::SubscriberInitExt, Layer};

/// Filter used when `RUST_LOG` isn't set: quiet dependencies, chatty pimsync.
const DEFAULT_DIRECTIVES: &str = "warn,pimsync_core=trace,pimsync_azure=trace,pimsync_cli=trace";

/// Set up basic logging
pub fn setup(level: Option<LevelFilter>) {
    // The user can specify directives via an env var
    // (such as for testing).
    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_DIRECTIVES.into());
    let mut logging_layers = vec![tracing_subscriber::EnvFilter::new(env).boxed()];

    // The input level overrides the default level
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level.unwrap_or(LevelFilter::INFO))
        .boxed();
    logging_layers.push(layer);

    // Actually initialize all logging layers
    tracing_subscriber::registry().with(logging_layers).init();

    debug!("logging set up");
}
