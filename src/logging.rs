//! Tracing subscriber setup for the command-line tool

use crate::Result;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Filter for `level`; `RUST_LOG` wins when set
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("nova_snapshot={}", level)))
}

/// Log to stderr
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Append log lines to `log_file`
pub fn init_file_logging(log_file: &Path, level: &str) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}
