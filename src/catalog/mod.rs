//! Relational record of every captured item, per section, cadence and dataset.
//!
//! [`CatalogStore`] is the storage seam; [`ChangeCatalog`] holds the writable
//! catalog of the active dataset next to a read-only view of the previous one
//! and answers "unchanged since the previous dataset?".

mod sqlite;

pub use sqlite::SqliteCatalog;

use crate::acl::AclEntry;
use crate::dataset::Cadence;
use crate::metadata::Item;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, error, warn, Span};

/// Which (section, cadence, dataset) a catalog row belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogKey {
    pub section: String,
    pub cadence: Cadence,
    pub dataset: u32,
}

/// One element row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    pub key: CatalogKey,
    pub path: ElementPath,
    /// `f`, `d` or `l`
    pub kind: &'static str,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub ctime: i64,
    pub mtime: i64,
}

impl CatalogRecord {
    pub fn from_item(key: &CatalogKey, item: &Item) -> Self {
        Self {
            key: key.clone(),
            path: ElementPath::new(&item.path),
            kind: item.kind.code(),
            owner: item.owner.as_ref().map(|o| o.to_string()),
            group: item.group.as_ref().map(|g| g.to_string()),
            ctime: item.ctime,
            mtime: item.mtime,
        }
    }
}

/// Last committed dataset and last run of one cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub cadence: Cadence,
    pub dataset: u32,
    pub last_run: Option<String>,
}

/// Storage backend for catalog rows.
///
/// Every backend reproduces the same three tables: elements keyed by
/// (section, cadence, dataset, path), ACLs keyed by (section, cadence,
/// dataset, path, subject, subject kind, permissions), and one status row
/// per cadence.
pub trait CatalogStore: Send {
    /// Create the schema if the store holds no tables yet. Returns true when created.
    fn bootstrap(&mut self) -> Result<bool>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn insert_element(&mut self, record: &CatalogRecord) -> Result<()>;

    fn insert_acl(&mut self, key: &CatalogKey, path: &ElementPath, entry: &AclEntry) -> Result<()>;

    /// Is there a row for `path` with exactly these timestamps?
    fn has_element(&self, key: &CatalogKey, path: &ElementPath, mtime: i64, ctime: i64) -> Result<bool>;

    fn status(&self, cadence: Cadence) -> Result<StatusRecord>;

    fn set_status(&mut self, cadence: Cadence, dataset: u32, last_run: DateTime<Utc>) -> Result<()>;
}

/// Backend selected by the `[database]` configuration table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackend {
    /// One embedded database file per catalog
    #[default]
    Sqlite,
}

impl CatalogBackend {
    /// Open (creating and bootstrapping if needed) a writable catalog
    pub fn open(&self, path: &Path) -> Result<Box<dyn CatalogStore>> {
        match self {
            CatalogBackend::Sqlite => {
                let mut store = SqliteCatalog::open(path)?;
                if store.bootstrap()? {
                    debug!("Bootstrapped catalog {}", path.display());
                }
                Ok(Box::new(store))
            }
        }
    }

    /// Open an existing catalog for queries only. Missing catalogs yield `None`.
    pub fn open_read_only(&self, path: &Path) -> Result<Option<Box<dyn CatalogStore>>> {
        if !path.exists() {
            return Ok(None);
        }
        match self {
            CatalogBackend::Sqlite => Ok(Some(Box::new(SqliteCatalog::open_read_only(path)?))),
        }
    }
}

/// Element path as stored in the catalog.
///
/// UTF-8 paths are stored as text. Any other path keeps its raw bytes, so two
/// names that only differ in invalid sequences never share a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementPath {
    Text(String),
    Raw(Vec<u8>),
}

impl ElementPath {
    pub fn new(path: &Path) -> Self {
        match path.to_str() {
            Some(text) => ElementPath::Text(text.to_string()),
            None => ElementPath::Raw(raw_bytes(path)),
        }
    }
}

#[cfg(unix)]
fn raw_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn raw_bytes(path: &Path) -> Vec<u8> {
    path.as_os_str().as_encoded_bytes().to_vec()
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementPath::Text(text) => f.write_str(text),
            ElementPath::Raw(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
        }
    }
}

/// Catalog pair used by one section job
pub struct ChangeCatalog {
    key: CatalogKey,
    previous_key: CatalogKey,
    current: Box<dyn CatalogStore>,
    previous: Option<Box<dyn CatalogStore>>,
    failures: usize,
    span: Span,
}

impl ChangeCatalog {
    /// Open the writable catalog for `key` and, if present, the read-only
    /// catalog of `previous_dataset`.
    pub fn open(
        backend: CatalogBackend,
        key: CatalogKey,
        current_path: &Path,
        previous_dataset: u32,
        previous_path: &Path,
        span: Span,
    ) -> Result<Self> {
        let mut current = backend.open(current_path)?;
        current.begin()?;

        // The previous dataset may be the one we are about to rewrite
        // (retention limit of 1); it is gone by now and simply not found.
        let previous = match backend.open_read_only(previous_path) {
            Ok(Some(mut store)) => match store.begin() {
                Ok(()) => Some(store),
                Err(e) => {
                    span.in_scope(|| {
                        error!("Previous catalog {} unusable: {}", previous_path.display(), e)
                    });
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                span.in_scope(|| {
                    error!("Unable to open previous catalog {}: {}", previous_path.display(), e)
                });
                None
            }
        };

        let previous_key = CatalogKey {
            dataset: previous_dataset,
            ..key.clone()
        };

        Ok(Self {
            key,
            previous_key,
            current,
            previous,
            failures: 0,
            span,
        })
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// Number of rows that could not be written so far
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// True only when the previous dataset recorded `path` with the same
    /// modification and change times. Any doubt counts as changed.
    pub fn was_unchanged(&self, path: &Path, mtime: i64, ctime: i64) -> bool {
        let Some(previous) = self.previous.as_ref() else {
            return false;
        };

        match previous.has_element(&self.previous_key, &ElementPath::new(path), mtime, ctime) {
            Ok(found) => found,
            Err(e) => {
                self.span.in_scope(|| {
                    warn!("Previous catalog lookup failed for {}: {}", path.display(), e)
                });
                false
            }
        }
    }

    /// Insert the element row of `item` and one row per ACL entry.
    ///
    /// Failed rows are logged and counted; the remaining rows are still written.
    /// Returns the number of rows that failed.
    pub fn record(&mut self, item: &Item) -> usize {
        let _enter = self.span.enter();
        let mut failed = 0;

        let record = CatalogRecord::from_item(&self.key, item);
        if let Err(e) = self.current.insert_element(&record) {
            error!("Unable to record element {}: {}", record.path, e);
            failed += 1;
        }

        for entry in &item.acl {
            if let Err(e) = self.current.insert_acl(&self.key, &record.path, entry) {
                error!(
                    "Unable to record ACL {}:{} for {}: {}",
                    entry.kind, entry.subject, record.path, e
                );
                failed += 1;
            }
        }

        self.failures += failed;
        failed
    }

    /// Commit the current catalog and release the previous one
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut previous) = self.previous.take() {
            if let Err(e) = previous.rollback() {
                self.span
                    .in_scope(|| warn!("Rollback of previous catalog failed: {}", e));
            }
        }

        self.current
            .commit()
            .map_err(|e| Error::catalog(format!("commit failed: {}", e)))
    }
}
