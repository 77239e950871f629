//! Error types for nova-snapshot

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for snapshot operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Per-item capture failure; the scan continues past it
    #[error("Scan failed for {path}: {reason}")]
    Scan { path: PathBuf, reason: String },

    /// Catalog query or insert failure
    #[error("Catalog error: {reason}")]
    Catalog { reason: String },

    /// I/O failure while materialising a file in the store
    #[error("Transfer failed for {path}: {source}")]
    Transfer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The previous dataset does not hold the path an unchanged item links to
    #[error("Previous dataset path missing: {path}")]
    DatasetBoundary { path: PathBuf },

    #[error("Dataset {index} outside of 1..={limit} for cadence {cadence}")]
    DatasetOutOfRange {
        cadence: String,
        index: u32,
        limit: u32,
    },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Section {section} exceeded its deadline of {seconds}s")]
    Timeout { section: String, seconds: u64 },

    /// A section worker stopped without returning a result
    #[error("Worker for section {section} failed: {reason}")]
    Worker { section: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn catalog(reason: impl Into<String>) -> Self {
        Error::Catalog {
            reason: reason.into(),
        }
    }
}

/// Result type alias for snapshot operations
pub type Result<T> = std::result::Result<T, Error>;
