//! Embedded SQLite catalog backend

use super::{CatalogKey, CatalogRecord, CatalogStore, ElementPath, StatusRecord};
use crate::acl::AclEntry;
use crate::dataset::Cadence;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
    CREATE TABLE elements (
        section VARCHAR(30) NOT NULL,
        cadence VARCHAR(5) NOT NULL,
        dataset INTEGER NOT NULL,
        element VARCHAR(1024) NOT NULL,
        element_type CHAR(1) NOT NULL,
        element_user VARCHAR(50),
        element_group VARCHAR(50),
        element_mtime INTEGER NOT NULL,
        element_ctime INTEGER NOT NULL,
        PRIMARY KEY (section, cadence, dataset, element)
    );
    CREATE TABLE acls (
        section VARCHAR(30) NOT NULL,
        cadence VARCHAR(5) NOT NULL,
        dataset INTEGER NOT NULL,
        element VARCHAR(1024) NOT NULL,
        id VARCHAR(50) NOT NULL,
        id_type CHAR(1) NOT NULL,
        perms VARCHAR(50) NOT NULL,
        PRIMARY KEY (section, cadence, dataset, element, id, id_type, perms)
    );
    CREATE TABLE status (
        cadence VARCHAR(5) PRIMARY KEY,
        actual INTEGER NOT NULL,
        last_run TIMESTAMP
    );
";

/// Text paths bind as TEXT, raw paths as BLOB. SQLite never considers a TEXT
/// value equal to a BLOB, so the two spaces cannot collide.
impl ToSql for ElementPath {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ElementPath::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            ElementPath::Raw(bytes) => ToSqlOutput::Borrowed(ValueRef::Blob(bytes)),
        })
    }
}

/// Catalog stored in one SQLite database file
pub struct SqliteCatalog {
    conn: Connection,
    read_only: bool,
}

impl SqliteCatalog {
    /// Open or create a writable catalog file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(Self {
            conn,
            read_only: false,
        })
    }

    /// Open an existing catalog file without write access
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            read_only: true,
        })
    }

    fn has_tables(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::catalog("catalog opened read-only"));
        }
        Ok(())
    }
}

impl CatalogStore for SqliteCatalog {
    fn bootstrap(&mut self) -> Result<bool> {
        if self.has_tables()? {
            return Ok(false);
        }
        self.ensure_writable()?;

        let tx = self.conn.transaction()?;
        tx.execute_batch(SCHEMA)?;
        for cadence in Cadence::ALL {
            tx.execute(
                "INSERT INTO status (cadence, actual, last_run) VALUES (?1, 0, current_timestamp)",
                params![cadence.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn insert_element(&mut self, record: &CatalogRecord) -> Result<()> {
        self.ensure_writable()?;
        self.conn.execute(
            "INSERT INTO elements (section, cadence, dataset, element, element_type,
                                   element_user, element_group, element_mtime, element_ctime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.key.section,
                record.key.cadence.as_str(),
                record.key.dataset,
                record.path,
                record.kind,
                record.owner,
                record.group,
                record.mtime,
                record.ctime,
            ],
        )?;
        Ok(())
    }

    fn insert_acl(&mut self, key: &CatalogKey, path: &ElementPath, entry: &AclEntry) -> Result<()> {
        self.ensure_writable()?;
        self.conn.execute(
            "INSERT INTO acls (section, cadence, dataset, element, id, id_type, perms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.section,
                key.cadence.as_str(),
                key.dataset,
                path,
                entry.subject,
                entry.kind.code(),
                entry.perms,
            ],
        )?;
        Ok(())
    }

    fn has_element(&self, key: &CatalogKey, path: &ElementPath, mtime: i64, ctime: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM elements
             WHERE section = ?1 AND cadence = ?2 AND dataset = ?3
               AND element = ?4 AND element_mtime = ?5 AND element_ctime = ?6",
            params![key.section, key.cadence.as_str(), key.dataset, path, mtime, ctime],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn status(&self, cadence: Cadence) -> Result<StatusRecord> {
        let row: Option<(u32, Option<String>)> = self
            .conn
            .query_row(
                "SELECT actual, last_run FROM status WHERE cadence = ?1",
                params![cadence.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (dataset, last_run) =
            row.ok_or_else(|| Error::catalog(format!("no status row for cadence {}", cadence)))?;
        Ok(StatusRecord {
            cadence,
            dataset,
            last_run,
        })
    }

    fn set_status(&mut self, cadence: Cadence, dataset: u32, last_run: DateTime<Utc>) -> Result<()> {
        self.ensure_writable()?;
        let updated = self.conn.execute(
            "UPDATE status SET actual = ?1, last_run = ?2 WHERE cadence = ?3",
            params![
                dataset,
                last_run.format(TIMESTAMP_FORMAT).to_string(),
                cadence.as_str()
            ],
        )?;
        if updated != 1 {
            return Err(Error::catalog(format!("no status row for cadence {}", cadence)));
        }
        Ok(())
    }
}
