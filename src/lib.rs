//! # nova-snapshot
//!
//! Generational, hardlink-deduplicated filesystem snapshots.
//!
//! ## Features
//!
//! - **Rotating datasets**: hourly, daily, weekly and monthly cycles with bounded retention
//! - **Change detection**: per-section SQLite catalog compared against the previous dataset
//! - **Deduplication**: unchanged files are hardlinked to the previous dataset's inode
//! - **Metadata capture**: BLAKE3 content hash, ownership, permissions and POSIX ACLs
//! - **Parallel sections**: bounded worker pool with optional per-section deadline
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nova_snapshot::{Cadence, Config, DatasetScheduler, Repository, RunMode, SyncOrchestrator};
//!
//! # #[tokio::main]
//! # async fn main() -> nova_snapshot::Result<()> {
//! let config = Config::load("/etc/nova-snapshot.toml")?;
//! let repository = Repository::new(&config.general.repository);
//! repository.bootstrap()?;
//!
//! let mut scheduler = DatasetScheduler::open(repository, config.dataset, config.database.backend)?;
//! let report = SyncOrchestrator::new(config)
//!     .run(&mut scheduler, Cadence::Day, RunMode::Advance)
//!     .await?;
//! println!("dataset {} committed: {}", report.dataset, report.committed);
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod scanner;
pub mod store;
pub mod sync;
pub mod transfer;

// Re-export commonly used types
pub use catalog::{CatalogBackend, ChangeCatalog};
pub use config::Config;
pub use dataset::{Cadence, DatasetScheduler, Repository, Retention};
pub use error::{Error, Result};
pub use metadata::{Item, MetadataExtractor};
pub use scanner::{ScanRecord, Scanner};
pub use store::SnapshotStore;
pub use sync::{RunMode, RunReport, SyncOrchestrator};
pub use transfer::{LocalTransfer, Transfer};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
