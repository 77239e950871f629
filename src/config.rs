//! Configuration file handling.
//!
//! The file is TOML. `[general]`, `[dataset]` and `[database]` are reserved;
//! every other table describes one backup section:
//!
//! ```toml
//! [general]
//! repository = "/srv/backup"
//! log_level = "info"
//!
//! [dataset]
//! hour = 24
//! day = 7
//!
//! [etc]
//! type = "file"
//! path = ["/etc"]
//! acl = true
//! ```

use crate::catalog::CatalogBackend;
use crate::dataset::Retention;
use crate::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tables that never describe a section
pub const RESERVED_SECTIONS: [&str; 3] = ["general", "dataset", "database"];

/// Upper bound for `general.workers`
pub const MAX_WORKERS: usize = 1024;

/// Section kind handled by the snapshot engine
pub const FILE_SECTION: &str = "file";

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    5
}

/// `[general]` table
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Root of the backup repository
    pub repository: PathBuf,
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum number of sections synchronised at once
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-section deadline in seconds
    pub job_timeout_secs: Option<u64>,
}

/// `[database]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: CatalogBackend,
}

/// One backup source
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SectionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Source roots, walked in order
    #[serde(default)]
    pub path: Vec<PathBuf>,
    /// Capture extended ACLs
    #[serde(default)]
    pub acl: bool,
}

impl SectionConfig {
    pub fn is_file(&self) -> bool {
        self.kind == FILE_SECTION
    }
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub dataset: Retention,
    pub database: DatabaseConfig,
    /// Sections sorted by name
    pub sections: Vec<(String, SectionConfig)>,
}

impl Config {
    /// Read and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let mut table: toml::Table = content.parse()?;

        let general: GeneralConfig = table
            .remove("general")
            .ok_or_else(|| Error::config("missing [general] table"))?
            .try_into()
            .map_err(|e| Error::config(format!("[general]: {}", e)))?;

        let dataset: Retention = match table.remove("dataset") {
            Some(value) => value
                .try_into()
                .map_err(|e| Error::config(format!("[dataset]: {}", e)))?,
            None => Retention::default(),
        };

        let database: DatabaseConfig = match table.remove("database") {
            Some(value) => value
                .try_into()
                .map_err(|e| Error::config(format!("[database]: {}", e)))?,
            None => DatabaseConfig::default(),
        };

        let mut sections = Vec::new();
        for (name, value) in table {
            if !value.is_table() {
                return Err(Error::config(format!("'{}' is not a section table", name)));
            }
            let section: SectionConfig = value
                .try_into()
                .map_err(|e| Error::config(format!("section '{}': {}", name, e)))?;
            sections.push((name, section));
        }
        sections.sort_by(|a, b| a.0.cmp(&b.0));

        let config = Self {
            general,
            dataset,
            database,
            sections,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate config settings
    pub fn validate(&self) -> Result<()> {
        if self.general.repository.as_os_str().is_empty() {
            return Err(Error::config("general.repository must not be empty"));
        }
        if self.general.workers == 0 || self.general.workers > MAX_WORKERS {
            return Err(Error::config(format!(
                "general.workers must be between 1 and {}",
                MAX_WORKERS
            )));
        }
        if self.general.job_timeout_secs == Some(0) {
            return Err(Error::config("general.job_timeout_secs must be greater than 0"));
        }
        self.dataset.validate()?;

        for (name, section) in &self.sections {
            if !valid_section_name(name) {
                return Err(Error::config(format!(
                    "section name '{}' must be a plain directory name",
                    name
                )));
            }
            if section.is_file() && section.path.is_empty() {
                return Err(Error::config(format!("section '{}' has no path", name)));
            }
        }

        Ok(())
    }

    /// Sections handled by the snapshot engine
    pub fn file_sections(&self) -> impl Iterator<Item = (&str, &SectionConfig)> {
        self.sections
            .iter()
            .filter(|(_, s)| s.is_file())
            .map(|(name, s)| (name.as_str(), s))
    }
}

fn valid_section_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !RESERVED_SECTIONS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
        [general]
        repository = "/srv/backup"
        log_level = "debug"
        workers = 2

        [dataset]
        hour = 6
        day = 3

        [database]
        backend = "sqlite"

        [home]
        type = "file"
        path = ["/home/alice", "/home/bob"]

        [etc]
        type = "file"
        path = ["/etc"]
        acl = true

        [mysql]
        type = "database"
    "#;

    #[test]
    fn test_parse_sample() -> Result<()> {
        let config = Config::parse(SAMPLE)?;

        assert_eq!(config.general.repository, PathBuf::from("/srv/backup"));
        assert_eq!(config.general.workers, 2);
        assert_eq!(config.general.job_timeout_secs, None);
        assert_eq!(config.dataset.hour, 6);
        assert_eq!(config.dataset.day, 3);
        assert_eq!(config.dataset.week, Retention::default().week);
        assert_eq!(config.database.backend, CatalogBackend::Sqlite);

        let names: Vec<&str> = config.sections.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["etc", "home", "mysql"]);

        let files: Vec<&str> = config.file_sections().map(|(n, _)| n).collect();
        assert_eq!(files, vec!["etc", "home"]);

        let (_, etc) = &config.sections[0];
        assert!(etc.acl);
        assert_eq!(etc.path, vec![PathBuf::from("/etc")]);
        Ok(())
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let config = Config::parse("[general]\nrepository = \"/r\"\n")?;
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.workers, 5);
        assert_eq!(config.dataset, Retention::default());
        assert!(config.sections.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_general() {
        let result = Config::parse("[etc]\ntype = \"file\"\npath = [\"/etc\"]\n");
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_section_without_type() {
        let result = Config::parse("[general]\nrepository = \"/r\"\n[etc]\npath = [\"/etc\"]\n");
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_unknown_backend() {
        let result = Config::parse("[general]\nrepository = \"/r\"\n[database]\nbackend = \"oracle\"\n");
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_zero_retention() {
        let result = Config::parse("[general]\nrepository = \"/r\"\n[dataset]\nday = 0\n");
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_file_section_needs_path() {
        let result = Config::parse("[general]\nrepository = \"/r\"\n[etc]\ntype = \"file\"\n");
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_workers_bounds() -> Result<()> {
        let parse = |workers: &str| Config::parse(&format!("[general]\nrepository = \"/r\"\nworkers = {}\n", workers));

        assert!(matches!(parse("0"), Err(Error::Configuration { .. })));
        assert!(matches!(parse("1025"), Err(Error::Configuration { .. })));
        assert!(matches!(parse("4611686018427387904"), Err(Error::Configuration { .. })));
        assert_eq!(parse("1024")?.general.workers, MAX_WORKERS);
        Ok(())
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(Config::parse("[general"), Err(Error::TomlParse(_))));
    }
}
