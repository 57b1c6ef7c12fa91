//! Tracing setup for the two binaries.
//!
//! Both read `RUST_LOG`. The agent writes compact lines to stderr; the native
//! host must keep stdout clean for frames, so it appends to a log file.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Stderr logging, `webpilot=info` unless `RUST_LOG` says otherwise.
pub fn init_stderr() {
    tracing_subscriber::registry()
        .with(filter("webpilot=info,agent=info"))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// File logging for the native host, `debug` unless `RUST_LOG` says otherwise.
pub fn init_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    tracing_subscriber::registry()
        .with(filter("debug"))
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .init();
    Ok(())
}
