//! Per-section orchestration.
//!
//! A run resolves one dataset index for the cadence, builds one plain
//! [`SectionJob`] per `file` section and runs the jobs on a bounded pool.
//! Each job opens its own scanner, catalogs and store. The dataset pointer is
//! committed only after every job has returned and none failed fatally.

use crate::acl;
use crate::catalog::{CatalogBackend, CatalogKey, ChangeCatalog};
use crate::config::{Config, SectionConfig};
use crate::dataset::{previous_index, Cadence, DatasetScheduler, Repository, Retention};
use crate::metadata::{ItemKind, MetadataExtractor};
use crate::scanner::Scanner;
use crate::store::{Materialized, SnapshotStore};
use crate::transfer::{LocalTransfer, Transfer};
use crate::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Span};

/// Builder state: nothing chosen yet
pub struct NeedsCadence;

/// Builder state: cadence chosen
pub struct NeedsDataset {
    cadence: Cadence,
}

/// Builder state: cadence and a validated dataset index chosen
#[derive(Clone)]
pub struct Ready {
    cadence: Cadence,
    dataset: u32,
    previous: u32,
}

/// Staged construction of [`SectionJob`]s: cadence, then dataset, then section.
#[derive(Clone)]
pub struct JobBuilder<S> {
    repository: Repository,
    retention: Retention,
    backend: CatalogBackend,
    state: S,
}

impl JobBuilder<NeedsCadence> {
    pub fn new(repository: Repository, retention: Retention, backend: CatalogBackend) -> Self {
        Self {
            repository,
            retention,
            backend,
            state: NeedsCadence,
        }
    }

    pub fn cadence(self, cadence: Cadence) -> JobBuilder<NeedsDataset> {
        JobBuilder {
            repository: self.repository,
            retention: self.retention,
            backend: self.backend,
            state: NeedsDataset { cadence },
        }
    }
}

impl JobBuilder<NeedsDataset> {
    /// Fix the dataset index; fails when it is outside the cadence's range
    pub fn dataset(self, dataset: u32) -> Result<JobBuilder<Ready>> {
        let cadence = self.state.cadence;
        self.retention.check(cadence, dataset)?;
        let previous = previous_index(dataset, self.retention.limit(cadence));
        Ok(JobBuilder {
            repository: self.repository,
            retention: self.retention,
            backend: self.backend,
            state: Ready {
                cadence,
                dataset,
                previous,
            },
        })
    }
}

impl JobBuilder<Ready> {
    pub fn section(&self, name: &str, config: &SectionConfig) -> SectionJob {
        SectionJob {
            section: name.to_string(),
            cadence: self.state.cadence,
            dataset: self.state.dataset,
            previous_dataset: self.state.previous,
            repository: self.repository.clone(),
            backend: self.backend,
            roots: config.path.clone(),
            acl: config.acl,
        }
    }
}

/// Everything a worker needs to sync one section. Holds no open handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionJob {
    pub section: String,
    pub cadence: Cadence,
    pub dataset: u32,
    pub previous_dataset: u32,
    pub repository: Repository,
    pub backend: CatalogBackend,
    pub roots: Vec<PathBuf>,
    pub acl: bool,
}

impl SectionJob {
    /// Logging context carried by every event of this job
    pub fn span(&self) -> Span {
        info_span!(
            "section",
            section = %self.section,
            cadence = %self.cadence,
            dataset = self.dataset
        )
    }

    fn key(&self) -> CatalogKey {
        CatalogKey {
            section: self.section.clone(),
            cadence: self.cadence,
            dataset: self.dataset,
        }
    }
}

/// Item counters of one section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub directories: usize,
    pub copied: usize,
    pub bytes_copied: u64,
    pub linked: usize,
    pub symlinks: usize,
    pub scan_errors: usize,
    pub transfer_errors: usize,
    pub boundary_errors: usize,
    pub catalog_errors: usize,
}

impl SyncStats {
    fn count(&mut self, materialized: Materialized) {
        match materialized {
            Materialized::Directory => self.directories += 1,
            Materialized::Copied(bytes) => {
                self.copied += 1;
                self.bytes_copied += bytes;
            }
            Materialized::Linked => self.linked += 1,
            Materialized::Symlink => self.symlinks += 1,
        }
    }

    /// Item-level failures; these never fail the section
    pub fn item_errors(&self) -> usize {
        self.scan_errors + self.transfer_errors + self.boundary_errors + self.catalog_errors
    }
}

/// Outcome of one section job
#[derive(Debug, Clone, Serialize)]
pub struct SectionReport {
    pub section: String,
    pub stats: SyncStats,
    /// Fatal error that stopped the section
    pub error: Option<String>,
}

impl SectionReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub cadence: Cadence,
    pub dataset: u32,
    pub committed: bool,
    pub sections: Vec<SectionReport>,
}

/// Which dataset a run writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Advance to the next dataset in the rotation
    Advance,
    /// Rewrite the last committed dataset
    Reload,
}

/// Sync one section: scan, compare with the previous dataset, store, record.
///
/// Item failures are counted and logged; only setup failures, a failed
/// catalog commit or cancellation return an error.
pub fn run_section(job: &SectionJob, transfer: Arc<dyn Transfer>, cancel: &AtomicBool) -> Result<SyncStats> {
    let span = job.span();
    let _enter = span.enter();
    info!("Section sync started");

    let repository = &job.repository;
    let store = SnapshotStore::open(
        repository.section_dir(job.cadence, job.dataset, &job.section),
        repository.section_dir(job.cadence, job.previous_dataset, &job.section),
        transfer,
        span.clone(),
    )?;
    let mut catalog = ChangeCatalog::open(
        job.backend,
        job.key(),
        &repository.section_catalog(job.cadence, job.dataset, &job.section),
        job.previous_dataset,
        &repository.section_catalog(job.cadence, job.previous_dataset, &job.section),
        span.clone(),
    )?;
    if !catalog.has_previous() {
        info!("No previous catalog, every file is copied");
    }

    let extractor = MetadataExtractor::new(acl::platform_provider(job.acl));
    let scanner = Scanner::new(job.roots.clone(), &extractor);
    let mut stats = SyncStats::default();

    for record in scanner.records() {
        if cancel.load(Ordering::Relaxed) {
            warn!("Section sync cancelled");
            return Err(Error::Cancelled);
        }

        let item = match record.item {
            Some(item) if record.is_ok() => item,
            _ => {
                stats.scan_errors += 1;
                continue;
            }
        };

        let unchanged =
            item.kind == ItemKind::File && catalog.was_unchanged(&item.path, item.mtime, item.ctime);

        // Only what made it into the store is recorded, so a failed copy or
        // link is retried by the next run instead of being linked forever.
        match store.add(&item, unchanged) {
            Ok(materialized) => {
                stats.count(materialized);
                catalog.record(&item);
            }
            Err(Error::DatasetBoundary { .. }) => stats.boundary_errors += 1,
            Err(Error::Transfer { .. }) => stats.transfer_errors += 1,
            Err(e) => {
                error!("Unable to store {}: {}", item.path.display(), e);
                stats.transfer_errors += 1;
            }
        }
    }

    stats.catalog_errors = catalog.failures();
    catalog.finish()?;

    info!(
        "Section sync completed: {} copied ({} bytes), {} linked, {} directories, {} item errors",
        stats.copied,
        stats.bytes_copied,
        stats.linked,
        stats.directories,
        stats.item_errors()
    );
    Ok(stats)
}

/// How long a cancelled section may take to stop before it is detached
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Runs every `file` section of a configuration against one dataset
pub struct SyncOrchestrator {
    config: Config,
    transfer: Arc<dyn Transfer>,
    cancel_grace: Duration,
}

impl SyncOrchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transfer: Arc::new(LocalTransfer::new()),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Time a section past its deadline gets to notice cancellation
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Use a different content transport
    pub fn with_transfer(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dataset index a run in `mode` would write
    pub fn resolve_dataset(&self, scheduler: &DatasetScheduler, cadence: Cadence, mode: RunMode) -> Result<u32> {
        match mode {
            RunMode::Advance => scheduler.next_dataset(cadence),
            RunMode::Reload => match scheduler.last_dataset(cadence)? {
                0 => scheduler.next_dataset(cadence),
                last => Ok(last),
            },
        }
    }

    /// Build the jobs of a run
    pub fn jobs(&self, cadence: Cadence, dataset: u32) -> Result<Vec<SectionJob>> {
        let builder = JobBuilder::new(
            Repository::new(&self.config.general.repository),
            self.config.dataset,
            self.config.database.backend,
        )
        .cadence(cadence)
        .dataset(dataset)?;

        for (name, section) in &self.config.sections {
            if !section.is_file() {
                warn!("Skipping section {} of unsupported type '{}'", name, section.kind);
            }
        }

        Ok(self
            .config
            .file_sections()
            .map(|(name, section)| builder.section(name, section))
            .collect())
    }

    /// Run every section for `cadence` and commit the dataset if all succeeded
    pub async fn run(&self, scheduler: &mut DatasetScheduler, cadence: Cadence, mode: RunMode) -> Result<RunReport> {
        let dataset = self.resolve_dataset(scheduler, cadence, mode)?;
        info!("Started backup: cadence {} dataset {}", cadence, dataset);

        // Rotation overwrite: nothing from the dataset's previous cycle survives.
        if scheduler.dataset_exists(cadence, dataset) {
            info!("Dataset {} of {} exists, removing it first", dataset, cadence);
            scheduler.remove_dataset(cadence, dataset)?;
        }

        let jobs = self.jobs(cadence, dataset)?;
        let sections = self.run_jobs(jobs).await;

        let committed = sections.iter().all(SectionReport::is_ok);
        if committed {
            scheduler.commit_dataset(cadence, dataset)?;
        } else {
            error!(
                "Dataset {} of {} not committed: {} section(s) failed",
                dataset,
                cadence,
                sections.iter().filter(|s| !s.is_ok()).count()
            );
        }

        Ok(RunReport {
            cadence,
            dataset,
            committed,
            sections,
        })
    }

    /// Run jobs on the bounded pool and wait for all of them
    async fn run_jobs(&self, jobs: Vec<SectionJob>) -> Vec<SectionReport> {
        let permits = Arc::new(Semaphore::new(self.config.general.workers));
        let deadline = self.config.general.job_timeout_secs.map(Duration::from_secs);
        let grace = self.cancel_grace;
        let mut pool = JoinSet::new();

        for (position, job) in jobs.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let transfer = Arc::clone(&self.transfer);

            pool.spawn(async move {
                let section = job.section.clone();
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => supervise(job, transfer, deadline, grace).await,
                    Err(_) => Err(Error::Cancelled),
                };
                (position, section, result)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((position, section, result)) => {
                    let report = match result {
                        Ok(stats) => SectionReport {
                            section,
                            stats,
                            error: None,
                        },
                        Err(e) => {
                            error!("Section {} failed: {}", section, e);
                            SectionReport {
                                section,
                                stats: SyncStats::default(),
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    reports.push((position, report));
                }
                Err(e) => {
                    error!("Section worker aborted: {}", e);
                    reports.push((
                        usize::MAX,
                        SectionReport {
                            section: "<unknown>".to_string(),
                            stats: SyncStats::default(),
                            error: Some(e.to_string()),
                        },
                    ));
                }
            }
        }

        reports.sort_by_key(|(position, _)| *position);
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

/// Run one job on a blocking thread, cancelling it once the deadline passes.
///
/// A cancelled worker stops at its next item. One stuck inside a single item
/// for longer than `grace` is detached; its section is reported as timed out,
/// so the dataset is not committed.
async fn supervise(
    job: SectionJob,
    transfer: Arc<dyn Transfer>,
    deadline: Option<Duration>,
    grace: Duration,
) -> Result<SyncStats> {
    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = Arc::clone(&cancel);
    let section = job.section.clone();

    let mut handle = tokio::task::spawn_blocking(move || run_section(&job, transfer, &worker_cancel));

    let joined = match deadline {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Section {} exceeded {}s, cancelling", section, limit.as_secs());
                cancel.store(true, Ordering::Relaxed);
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    error!(
                        "Section {} did not stop within {}s of cancellation, detaching it",
                        section,
                        grace.as_secs()
                    );
                }
                return Err(Error::Timeout {
                    section,
                    seconds: limit.as_secs(),
                });
            }
        },
        None => handle.await,
    };

    joined.map_err(|e| Error::Worker {
        section,
        reason: e.to_string(),
    })?
}
