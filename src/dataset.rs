//! Dataset rotation: cadences, retention limits, repository layout and the
//! committed dataset pointer.

use crate::catalog::{CatalogBackend, CatalogStore, StatusRecord};
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name of every catalog database in the repository
pub const CATALOG_FILE: &str = ".nova-catalog.db";

const TRASH_PREFIX: &str = ".trash-";

/// Independent rotation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Hour,
    Day,
    Week,
    Month,
}

impl Cadence {
    pub const ALL: [Cadence; 4] = [Cadence::Hour, Cadence::Day, Cadence::Week, Cadence::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Hour => "hour",
            Cadence::Day => "day",
            Cadence::Week => "week",
            Cadence::Month => "month",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hour" => Ok(Cadence::Hour),
            "day" => Ok(Cadence::Day),
            "week" => Ok(Cadence::Week),
            "month" => Ok(Cadence::Month),
            other => Err(Error::config(format!("unknown cadence '{}'", other))),
        }
    }
}

/// Highest dataset index per cadence before wrapping back to 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Retention {
    pub hour: u32,
    pub day: u32,
    pub week: u32,
    pub month: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            hour: 24,
            day: 7,
            week: 4,
            month: 12,
        }
    }
}

impl Retention {
    pub fn limit(&self, cadence: Cadence) -> u32 {
        match cadence {
            Cadence::Hour => self.hour,
            Cadence::Day => self.day,
            Cadence::Week => self.week,
            Cadence::Month => self.month,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for cadence in Cadence::ALL {
            if self.limit(cadence) == 0 {
                return Err(Error::config(format!(
                    "retention limit for '{}' must be at least 1",
                    cadence
                )));
            }
        }
        Ok(())
    }

    /// Check that `index` is a valid dataset of `cadence`
    pub fn check(&self, cadence: Cadence, index: u32) -> Result<()> {
        let limit = self.limit(cadence);
        if index == 0 || index > limit {
            return Err(Error::DatasetOutOfRange {
                cadence: cadence.to_string(),
                index,
                limit,
            });
        }
        Ok(())
    }
}

/// Index following `current`, wrapping to 1 past `limit`
pub fn next_index(current: u32, limit: u32) -> u32 {
    if current >= limit {
        1
    } else {
        current + 1
    }
}

/// Index preceding `index`, wrapping to `limit` below 1
pub fn previous_index(index: u32, limit: u32) -> u32 {
    if index <= 1 {
        limit
    } else {
        index - 1
    }
}

/// Directory layout of a backup repository:
/// `<root>/<cadence>/<dataset>/<section>/...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and the cadence directories if they are missing
    pub fn bootstrap(&self) -> io::Result<()> {
        for cadence in Cadence::ALL {
            fs::create_dir_all(self.cadence_dir(cadence))?;
        }
        Ok(())
    }

    pub fn cadence_dir(&self, cadence: Cadence) -> PathBuf {
        self.root.join(cadence.as_str())
    }

    pub fn dataset_dir(&self, cadence: Cadence, index: u32) -> PathBuf {
        self.cadence_dir(cadence).join(index.to_string())
    }

    pub fn section_dir(&self, cadence: Cadence, index: u32, section: &str) -> PathBuf {
        self.dataset_dir(cadence, index).join(section)
    }

    /// Catalog holding the per-cadence status rows
    pub fn status_catalog(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    /// Catalog of one section within one dataset
    pub fn section_catalog(&self, cadence: Cadence, index: u32, section: &str) -> PathBuf {
        self.section_dir(cadence, index, section).join(CATALOG_FILE)
    }
}

/// Resolves, commits and removes datasets
pub struct DatasetScheduler {
    repository: Repository,
    retention: Retention,
    status: Box<dyn CatalogStore>,
}

impl DatasetScheduler {
    /// Open the repository status catalog, bootstrapping it on first use
    pub fn open(repository: Repository, retention: Retention, backend: CatalogBackend) -> Result<Self> {
        retention.validate()?;
        let status = backend.open(&repository.status_catalog())?;
        let scheduler = Self {
            repository,
            retention,
            status,
        };
        scheduler.sweep_trash();
        Ok(scheduler)
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn status(&self, cadence: Cadence) -> Result<StatusRecord> {
        self.status.status(cadence)
    }

    /// Last committed dataset index (0 when nothing was committed yet)
    pub fn last_dataset(&self, cadence: Cadence) -> Result<u32> {
        Ok(self.status.status(cadence)?.dataset)
    }

    /// Dataset the next run should write. Does not move the pointer.
    pub fn next_dataset(&self, cadence: Cadence) -> Result<u32> {
        let current = self.last_dataset(cadence)?;
        Ok(next_index(current, self.retention.limit(cadence)))
    }

    /// Persist `index` as the last completed dataset of `cadence`
    pub fn commit_dataset(&mut self, cadence: Cadence, index: u32) -> Result<()> {
        self.retention.check(cadence, index)?;
        self.status.begin()?;
        if let Err(e) = self.status.set_status(cadence, index, Utc::now()) {
            self.status.rollback()?;
            return Err(e);
        }
        self.status.commit()?;
        info!("Committed dataset {} for cadence {}", index, cadence);
        Ok(())
    }

    pub fn dataset_exists(&self, cadence: Cadence, index: u32) -> bool {
        self.repository.dataset_dir(cadence, index).exists()
    }

    /// Remove a whole dataset.
    ///
    /// The tree is first renamed to a hidden trash name, which is atomic on
    /// one filesystem, and then deleted. A crash during deletion leaves only
    /// the trash directory behind; it is swept when the scheduler next opens.
    /// Returns false when the dataset did not exist.
    pub fn remove_dataset(&self, cadence: Cadence, index: u32) -> Result<bool> {
        self.retention.check(cadence, index)?;
        let path = self.repository.dataset_dir(cadence, index);
        if !path.exists() {
            return Ok(false);
        }

        let trash = self
            .repository
            .cadence_dir(cadence)
            .join(format!("{}{}-{}", TRASH_PREFIX, index, Uuid::new_v4()));
        fs::rename(&path, &trash)?;
        fs::remove_dir_all(&trash)?;

        info!("Removed dataset {} for cadence {}", index, cadence);
        Ok(true)
    }

    /// Delete trash directories left over by interrupted removals
    pub fn sweep_trash(&self) {
        for cadence in Cadence::ALL {
            let dir = self.repository.cadence_dir(cadence);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for entry in entries.flatten() {
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with(TRASH_PREFIX) {
                    continue;
                }
                let path = entry.path();
                debug!("Sweeping {}", path.display());
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!("Unable to sweep {}: {}", path.display(), e);
                }
            }
        }
    }
}
