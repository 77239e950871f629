//! Content transfer capability used by the snapshot store.
//!
//! The store asks a [`Transfer`] for a byte stream per item and hands it back
//! for writing; how bytes travel (local disk, a remote lister's socket) is the
//! transport's business.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Byte stream of one item's content
pub type ByteStream = Box<dyn Read + Send>;

/// Fetches item content and writes it to a destination
pub trait Transfer: Send + Sync {
    /// Open the content of the item at `item_path`
    fn get_file(&self, item_path: &Path) -> io::Result<ByteStream>;

    /// Write `stream` to `destination`, returning the number of bytes written
    fn put_file(&self, destination: &Path, stream: &mut dyn Read) -> io::Result<u64>;
}

/// Transfer reading sources from the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransfer;

impl LocalTransfer {
    pub fn new() -> Self {
        Self
    }
}

impl Transfer for LocalTransfer {
    fn get_file(&self, item_path: &Path) -> io::Result<ByteStream> {
        Ok(Box::new(File::open(item_path)?))
    }

    /// Writes to a sibling temporary file first and renames it into place,
    /// so a destination is either complete or absent.
    fn put_file(&self, destination: &Path, stream: &mut dyn Read) -> io::Result<u64> {
        let partial = partial_path(destination);

        let written = (|| {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&partial)?;
            let mut writer = BufWriter::new(file);
            let written = io::copy(stream, &mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            Ok::<u64, io::Error>(written)
        })();

        match written {
            Ok(written) => {
                fs::rename(&partial, destination)?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e)
            }
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".nova-partial");
    destination.with_file_name(name)
}
