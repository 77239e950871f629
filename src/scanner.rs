//! Lazy walk over configured source roots.
//!
//! Every directory is reported only after all of its children: first the
//! subdirectories (each fully walked), then the files, then the directory
//! itself. Its timestamps and ACLs are therefore read once nothing below it
//! changes any more.

use crate::metadata::{Item, MetadataExtractor};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Whether an item was captured successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error,
}

/// One entry of the record feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub path: PathBuf,
    /// Platform family the record was captured on
    pub os: String,
    /// Captured attributes; absent when capture failed
    pub item: Option<Item>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanRecord {
    fn captured(item: Item) -> Self {
        Self {
            path: item.path.clone(),
            os: std::env::consts::FAMILY.to_string(),
            item: Some(item),
            outcome: Outcome::Ok,
            error: None,
        }
    }

    fn failed(path: PathBuf, error: String) -> Self {
        Self {
            path,
            os: std::env::consts::FAMILY.to_string(),
            item: None,
            outcome: Outcome::Error,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }
}

/// Walks an ordered list of source roots
pub struct Scanner<'a> {
    roots: Vec<PathBuf>,
    extractor: &'a MetadataExtractor,
}

impl<'a> Scanner<'a> {
    pub fn new(roots: Vec<PathBuf>, extractor: &'a MetadataExtractor) -> Self {
        Self { roots, extractor }
    }

    /// Start a fresh walk. Walks are not resumable; call again to rescan.
    pub fn records(&self) -> Records<'_> {
        Records {
            extractor: self.extractor,
            roots: self.roots.iter(),
            current: None,
        }
    }
}

/// Iterator over [`ScanRecord`]s, never cut short by a failing path
pub struct Records<'s> {
    extractor: &'s MetadataExtractor,
    roots: std::slice::Iter<'s, PathBuf>,
    current: Option<(PathBuf, walkdir::IntoIter)>,
}

impl Iterator for Records<'_> {
    type Item = ScanRecord;

    fn next(&mut self) -> Option<ScanRecord> {
        loop {
            if let Some((root, walker)) = self.current.as_mut() {
                match walker.next() {
                    Some(Ok(entry)) => return Some(capture(self.extractor, entry.path())),
                    Some(Err(e)) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                        warn!("Scan failed for {}: {}", path.display(), e);
                        return Some(ScanRecord::failed(path, e.to_string()));
                    }
                    None => self.current = None,
                }
            }

            let root = self.roots.next()?;
            self.current = Some((root.clone(), walk(root)));
        }
    }
}

fn capture(extractor: &MetadataExtractor, path: &Path) -> ScanRecord {
    match extractor.compute(path) {
        Ok(item) => ScanRecord::captured(item),
        Err(e) => {
            warn!("Scan failed for {}: {}", path.display(), e);
            ScanRecord::failed(path.to_path_buf(), e.to_string())
        }
    }
}

fn walk(root: &Path) -> walkdir::IntoIter {
    WalkDir::new(root)
        .follow_links(false)
        .contents_first(true)
        .sort_by(directories_first)
        .into_iter()
}

fn directories_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    let a_dir = a.file_type().is_dir();
    let b_dir = b.file_type().is_dir();
    b_dir
        .cmp(&a_dir)
        .then_with(|| a.file_name().cmp(b.file_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ItemKind;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn build_tree(root: &Path) -> std::io::Result<()> {
        fs::create_dir_all(root.join("a"))?;
        fs::create_dir_all(root.join("b"))?;
        fs::write(root.join("a").join("x.txt"), b"x")?;
        fs::write(root.join("f1.txt"), b"1")?;
        fs::write(root.join("f2.txt"), b"2")?;
        Ok(())
    }

    #[test]
    fn test_children_before_parent() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        build_tree(&root)?;

        let extractor = MetadataExtractor::default();
        let scanner = Scanner::new(vec![root.clone()], &extractor);
        let paths: Vec<PathBuf> = scanner.records().map(|r| r.path).collect();

        assert_eq!(
            paths,
            vec![
                root.join("a").join("x.txt"),
                root.join("a"),
                root.join("b"),
                root.join("f1.txt"),
                root.join("f2.txt"),
                root.clone(),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_each_path_emitted_once() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        build_tree(&root)?;
        fs::create_dir_all(root.join("a").join("deep").join("deeper"))?;

        let extractor = MetadataExtractor::default();
        let scanner = Scanner::new(vec![root.clone()], &extractor);
        let mut paths: Vec<PathBuf> = scanner.records().map(|r| r.path).collect();
        let total = paths.len();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), total);
        Ok(())
    }

    #[test]
    fn test_missing_root_does_not_stop_scan() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let good = temp_dir.path().join("good");
        fs::create_dir_all(&good)?;
        fs::write(good.join("file"), b"content")?;

        let missing = temp_dir.path().join("missing");
        let extractor = MetadataExtractor::default();
        let scanner = Scanner::new(vec![missing.clone(), good.clone()], &extractor);
        let records: Vec<ScanRecord> = scanner.records().collect();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].outcome, Outcome::Error);
        assert_eq!(records[0].path, missing);
        assert!(records[0].item.is_none());

        assert!(records[1].is_ok());
        assert_eq!(records[1].item.as_ref().map(|i| i.kind), Some(ItemKind::File));
        assert_eq!(records[2].path, good);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_fifo_becomes_error_record() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(&root)?;
        fs::write(root.join("a.txt"), b"a")?;
        crate::metadata::make_fifo(&root.join("pipe"))?;
        fs::write(root.join("z.txt"), b"z")?;

        let extractor = MetadataExtractor::default();
        let scanner = Scanner::new(vec![root.clone()], &extractor);
        let records: Vec<ScanRecord> = scanner.records().collect();

        let outcomes: Vec<(PathBuf, Outcome)> = records.iter().map(|r| (r.path.clone(), r.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (root.join("a.txt"), Outcome::Ok),
                (root.join("pipe"), Outcome::Error),
                (root.join("z.txt"), Outcome::Ok),
                (root.clone(), Outcome::Ok),
            ]
        );
        assert!(records[1].error.as_deref().unwrap().contains("unsupported file type"));
        Ok(())
    }

    #[test]
    fn test_rescan_starts_from_scratch() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        build_tree(temp_dir.path())?;

        let extractor = MetadataExtractor::default();
        let scanner = Scanner::new(vec![temp_dir.path().to_path_buf()], &extractor);
        let first = scanner.records().count();
        let second = scanner.records().count();
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_record_serializes_as_json_line() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("f"), b"abc")?;

        let extractor = MetadataExtractor::default();
        let scanner = Scanner::new(vec![temp_dir.path().join("f")], &extractor);
        let record = scanner.records().next().expect("one record");

        let line = serde_json::to_string(&record)?;
        assert!(!line.contains('\n'));
        assert!(line.contains("\"outcome\":\"ok\""));
        assert!(line.contains("\"kind\":\"file\""));

        let parsed: ScanRecord = serde_json::from_str(&line)?;
        assert_eq!(parsed, record);
        Ok(())
    }
}
