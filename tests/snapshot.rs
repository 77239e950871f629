//! End-to-end runs against a scratch repository

#![cfg(unix)]

use filetime::FileTime;
use nova_snapshot::config::{DatabaseConfig, GeneralConfig, SectionConfig};
use nova_snapshot::store::relative;
use nova_snapshot::{Cadence, CatalogBackend, Config, DatasetScheduler, Repository, Retention, RunMode, SyncOrchestrator};
use pretty_assertions::assert_eq;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SECTION: &str = "data";

struct Fixture {
    _temp_dir: TempDir,
    source: PathBuf,
    repository: Repository,
    orchestrator: SyncOrchestrator,
    scheduler: DatasetScheduler,
}

impl Fixture {
    fn new(day_limit: u32) -> nova_snapshot::Result<Self> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;

        let root = temp_dir.path().join("repository");
        let config = Config {
            general: GeneralConfig {
                repository: root.clone(),
                log_file: None,
                log_level: "debug".to_string(),
                workers: 1,
                job_timeout_secs: Some(60),
            },
            dataset: Retention {
                day: day_limit,
                ..Retention::default()
            },
            database: DatabaseConfig::default(),
            sections: vec![(
                SECTION.to_string(),
                SectionConfig {
                    kind: "file".to_string(),
                    path: vec![source.clone()],
                    acl: false,
                },
            )],
        };
        config.validate()?;

        let repository = Repository::new(&root);
        repository.bootstrap()?;
        let scheduler = DatasetScheduler::open(repository.clone(), config.dataset, CatalogBackend::Sqlite)?;

        Ok(Self {
            _temp_dir: temp_dir,
            source,
            repository,
            orchestrator: SyncOrchestrator::new(config),
            scheduler,
        })
    }

    async fn run(&mut self) -> nova_snapshot::Result<nova_snapshot::RunReport> {
        self.orchestrator
            .run(&mut self.scheduler, Cadence::Day, RunMode::Advance)
            .await
    }

    /// Where a source file lives inside a stored dataset
    fn stored(&self, dataset: u32, source_path: &Path) -> PathBuf {
        self.repository
            .section_dir(Cadence::Day, dataset, SECTION)
            .join(relative(source_path))
    }
}

fn inode(path: &Path) -> u64 {
    fs::metadata(path).unwrap().ino()
}

#[tokio::test]
async fn test_unchanged_files_are_hardlinked() -> nova_snapshot::Result<()> {
    let mut fixture = Fixture::new(7)?;
    let a = fixture.source.join("a.txt");
    let b = fixture.source.join("nested").join("b.txt");
    fs::create_dir_all(b.parent().unwrap())?;
    fs::write(&a, b"X")?;
    fs::write(&b, b"Y")?;

    let first = fixture.run().await?;
    assert!(first.committed);
    assert_eq!(first.dataset, 1);
    assert_eq!(first.sections[0].stats.copied, 2);
    assert_eq!(first.sections[0].stats.linked, 0);

    fs::write(&b, b"Y2")?;
    filetime::set_file_mtime(&b, FileTime::from_unix_time(1_000_000_000, 0))?;

    let second = fixture.run().await?;
    assert!(second.committed);
    assert_eq!(second.dataset, 2);
    assert_eq!(second.sections[0].stats.linked, 1);
    assert_eq!(second.sections[0].stats.copied, 1);

    assert_eq!(inode(&fixture.stored(1, &a)), inode(&fixture.stored(2, &a)));
    assert_eq!(fs::read(fixture.stored(2, &a))?, b"X");

    assert_ne!(inode(&fixture.stored(1, &b)), inode(&fixture.stored(2, &b)));
    assert_eq!(fs::read(fixture.stored(1, &b))?, b"Y");
    assert_eq!(fs::read(fixture.stored(2, &b))?, b"Y2");

    assert_eq!(fixture.scheduler.last_dataset(Cadence::Day)?, 2);
    Ok(())
}

#[tokio::test]
async fn test_rotation_leaves_no_stale_files() -> nova_snapshot::Result<()> {
    let mut fixture = Fixture::new(3)?;
    let keep = fixture.source.join("keep.txt");
    let stale = fixture.source.join("stale.txt");
    fs::write(&keep, b"keep")?;
    fs::write(&stale, b"stale")?;

    assert_eq!(fixture.run().await?.dataset, 1);
    assert!(fixture.stored(1, &stale).exists());

    fs::remove_file(&stale)?;
    let mut indexes = Vec::new();
    for _ in 0..3 {
        let report = fixture.run().await?;
        assert!(report.committed);
        indexes.push(report.dataset);
    }
    assert_eq!(indexes, vec![2, 3, 1]);

    assert!(!fixture.stored(1, &stale).exists());
    assert_eq!(fs::read(fixture.stored(1, &keep))?, b"keep");
    assert_eq!(inode(&fixture.stored(1, &keep)), inode(&fixture.stored(3, &keep)));
    assert_eq!(fixture.scheduler.last_dataset(Cadence::Day)?, 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_previous_copy_is_contained() -> nova_snapshot::Result<()> {
    let mut fixture = Fixture::new(7)?;
    let lost = fixture.source.join("lost.txt");
    let other = fixture.source.join("other.txt");
    fs::write(&lost, b"lost")?;
    fs::write(&other, b"other")?;

    fixture.run().await?;
    fs::remove_file(fixture.stored(1, &lost))?;

    let second = fixture.run().await?;
    let stats = &second.sections[0].stats;
    assert!(second.committed);
    assert_eq!(stats.boundary_errors, 1);
    assert_eq!(stats.linked, 1);
    assert!(!fixture.stored(2, &lost).exists());
    assert_eq!(fs::read(fixture.stored(2, &other))?, b"other");

    // Not recorded in dataset 2, so the next run copies it again
    let third = fixture.run().await?;
    assert_eq!(third.sections[0].stats.boundary_errors, 0);
    assert_eq!(fs::read(fixture.stored(3, &lost))?, b"lost");
    Ok(())
}

#[tokio::test]
async fn test_unsupported_item_is_contained() -> nova_snapshot::Result<()> {
    let mut fixture = Fixture::new(7)?;
    let a = fixture.source.join("a.txt");
    let b = fixture.source.join("b.txt");
    let pipe = fixture.source.join("pipe");
    fs::write(&a, b"A")?;
    fs::write(&b, b"B")?;
    let c_path = CString::new(pipe.as_os_str().as_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) }, 0);

    let report = fixture.run().await?;
    let stats = &report.sections[0].stats;
    assert!(report.committed);
    assert_eq!(report.dataset, 1);
    assert_eq!(stats.scan_errors, 1);
    assert_eq!(stats.copied, 2);
    assert_eq!(fs::read(fixture.stored(1, &a))?, b"A");
    assert_eq!(fs::read(fixture.stored(1, &b))?, b"B");
    assert!(fs::symlink_metadata(fixture.stored(1, &pipe)).is_err());
    assert_eq!(fixture.scheduler.last_dataset(Cadence::Day)?, 1);
    Ok(())
}

#[tokio::test]
async fn test_report_serialises() -> nova_snapshot::Result<()> {
    let mut fixture = Fixture::new(7)?;
    fs::write(fixture.source.join("f"), b"1")?;

    let report = fixture.run().await?;
    let json: serde_json::Value = serde_json::to_value(&report)?;
    assert_eq!(json["cadence"], "day");
    assert_eq!(json["dataset"], 1);
    assert_eq!(json["committed"], true);
    assert_eq!(json["sections"][0]["section"], SECTION);
    assert_eq!(json["sections"][0]["stats"]["copied"], 1);
    Ok(())
}
