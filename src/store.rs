//! Filesystem side of a snapshot: realises one section's dataset tree.
//!
//! Directories are created, unchanged files are hardlinked from the previous
//! dataset and everything else is written through the [`Transfer`].

use crate::metadata::{Item, ItemKind};
use crate::transfer::Transfer;
use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, Span};

/// How an item ended up in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    Directory,
    /// Content written, with its size in bytes
    Copied(u64),
    /// Hardlinked to the previous dataset's inode
    Linked,
    Symlink,
}

/// Store for one section of the active dataset
pub struct SnapshotStore {
    section_dir: PathBuf,
    previous_dir: PathBuf,
    transfer: Arc<dyn Transfer>,
    span: Span,
}

impl SnapshotStore {
    /// Create the section directory of the active dataset if needed
    pub fn open(
        section_dir: PathBuf,
        previous_dir: PathBuf,
        transfer: Arc<dyn Transfer>,
        span: Span,
    ) -> Result<Self> {
        fs::create_dir_all(&section_dir)?;
        Ok(Self {
            section_dir,
            previous_dir,
            transfer,
            span,
        })
    }

    /// Where `item_path` lives in the active dataset
    pub fn destination(&self, item_path: &Path) -> PathBuf {
        self.section_dir.join(relative(item_path))
    }

    /// Where `item_path` lives in the previous dataset
    pub fn previous(&self, item_path: &Path) -> PathBuf {
        self.previous_dir.join(relative(item_path))
    }

    /// Realise `item`; `unchanged` selects a hardlink over a fresh copy for files
    pub fn add(&self, item: &Item, unchanged: bool) -> Result<Materialized> {
        match item.kind {
            ItemKind::Directory => self.add_directory(item).map(|_| Materialized::Directory),
            ItemKind::Symlink => self.add_symlink(item).map(|_| Materialized::Symlink),
            ItemKind::File if unchanged => self.link_unchanged(item).map(|_| Materialized::Linked),
            ItemKind::File => self.write(item).map(Materialized::Copied),
        }
    }

    /// Create the directory, tolerating one that already exists
    pub fn add_directory(&self, item: &Item) -> Result<()> {
        let destination = self.destination(&item.path);
        fs::create_dir_all(&destination).map_err(|e| self.transfer_error(&item.path, e))
    }

    /// Hardlink the previous dataset's copy of `item` into the active dataset
    pub fn link_unchanged(&self, item: &Item) -> Result<()> {
        let source = self.previous(&item.path);
        let destination = self.destination(&item.path);

        if fs::symlink_metadata(&source).is_err() {
            self.span.in_scope(|| {
                error!(
                    "DatasetBoundaryError: {} unchanged but {} is missing, link skipped",
                    item.path.display(),
                    source.display()
                )
            });
            return Err(Error::DatasetBoundary { path: source });
        }

        self.ensure_parent(&item.path, &destination)?;
        let linked = match fs::hard_link(&source, &destination) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                fs::remove_file(&destination).and_then(|_| fs::hard_link(&source, &destination))
            }
            other => other,
        };
        linked.map_err(|e| self.transfer_error(&item.path, e))?;

        self.span
            .in_scope(|| debug!("Linked {} from previous dataset", item.path.display()));
        Ok(())
    }

    /// Fetch the content of `item` and write it into the active dataset
    pub fn write(&self, item: &Item) -> Result<u64> {
        let destination = self.destination(&item.path);
        self.ensure_parent(&item.path, &destination)?;

        let mut stream = self
            .transfer
            .get_file(&item.path)
            .map_err(|e| self.transfer_error(&item.path, e))?;
        let written = self
            .transfer
            .put_file(&destination, &mut stream)
            .map_err(|e| self.transfer_error(&item.path, e))?;

        self.span
            .in_scope(|| debug!("Copied {} ({} bytes)", item.path.display(), written));
        Ok(written)
    }

    /// Recreate a symlink pointing at the captured target
    pub fn add_symlink(&self, item: &Item) -> Result<()> {
        let destination = self.destination(&item.path);
        self.ensure_parent(&item.path, &destination)?;

        let target = item.link_target.clone().unwrap_or_default();
        if fs::symlink_metadata(&destination).is_ok() {
            fs::remove_file(&destination).map_err(|e| self.transfer_error(&item.path, e))?;
        }
        make_symlink(&target, &destination).map_err(|e| self.transfer_error(&item.path, e))
    }

    fn ensure_parent(&self, item_path: &Path, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| self.transfer_error(item_path, e))?;
        }
        Ok(())
    }

    fn transfer_error(&self, item_path: &Path, source: io::Error) -> Error {
        self.span.in_scope(|| {
            error!(
                "I/O error ({:?}) for item {}: {}",
                source.kind(),
                item_path.display(),
                source
            )
        });
        Error::Transfer {
            path: item_path.to_path_buf(),
            source,
        }
    }
}

/// Item path relative to a section directory: root, prefix and `..`
/// components are dropped so every item lands inside the section.
pub fn relative(item_path: &Path) -> PathBuf {
    item_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

#[cfg(unix)]
fn make_symlink(target: &Path, destination: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, destination)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _destination: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataExtractor;
    use crate::transfer::LocalTransfer;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> Result<SnapshotStore> {
        SnapshotStore::open(
            temp_dir.path().join("repo/day/2/etc"),
            temp_dir.path().join("repo/day/1/etc"),
            Arc::new(LocalTransfer::new()),
            Span::none(),
        )
    }

    #[test]
    fn test_relative_strips_root_and_parent() {
        assert_eq!(relative(Path::new("/etc/ssh/sshd_config")), PathBuf::from("etc/ssh/sshd_config"));
        assert_eq!(relative(Path::new("/srv/../etc/x")), PathBuf::from("srv/etc/x"));
        assert_eq!(relative(Path::new("./a/b")), PathBuf::from("a/b"));
    }

    #[test]
    fn test_write_creates_parents() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("src").join("deep").join("file.txt");
        fs::create_dir_all(source.parent().unwrap())?;
        fs::write(&source, b"content")?;

        let store = store(&temp_dir)?;
        let item = MetadataExtractor::default().compute(&source)?;
        assert_eq!(store.add(&item, false)?, Materialized::Copied(7));
        assert_eq!(fs::read(store.destination(&source))?, b"content");
        Ok(())
    }

    #[test]
    fn test_directory_tolerates_existing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join("src");
        fs::create_dir_all(&dir)?;

        let store = store(&temp_dir)?;
        let item = MetadataExtractor::default().compute(&dir)?;
        assert_eq!(store.add(&item, false)?, Materialized::Directory);
        assert_eq!(store.add(&item, false)?, Materialized::Directory);
        assert!(store.destination(&dir).is_dir());
        Ok(())
    }

    #[test]
    fn test_missing_previous_is_boundary_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("src.txt");
        fs::write(&source, b"x")?;

        let store = store(&temp_dir)?;
        let item = MetadataExtractor::default().compute(&source)?;
        let result = store.add(&item, true);
        assert!(matches!(result, Err(Error::DatasetBoundary { .. })));
        assert!(!store.destination(&source).exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_link_shares_inode() -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("src.txt");
        fs::write(&source, b"x")?;

        let store = store(&temp_dir)?;
        let previous = store.previous(&source);
        fs::create_dir_all(previous.parent().unwrap())?;
        fs::write(&previous, b"x")?;

        let item = MetadataExtractor::default().compute(&source)?;
        assert_eq!(store.add(&item, true)?, Materialized::Linked);
        assert_eq!(
            fs::metadata(&previous)?.ino(),
            fs::metadata(store.destination(&source))?.ino()
        );
        Ok(())
    }

    #[test]
    fn test_unreadable_source_is_transfer_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("vanishing.txt");
        fs::write(&source, b"x")?;
        let item = MetadataExtractor::default().compute(&source)?;
        fs::remove_file(&source)?;

        let store = store(&temp_dir)?;
        assert!(matches!(store.add(&item, false), Err(Error::Transfer { .. })));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_recreated() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink("target-file", &link)?;

        let store = store(&temp_dir)?;
        let item = MetadataExtractor::default().compute(&link)?;
        assert_eq!(store.add(&item, false)?, Materialized::Symlink);
        assert_eq!(fs::read_link(store.destination(&link))?, PathBuf::from("target-file"));
        Ok(())
    }
}
