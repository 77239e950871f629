//! Per-path attribute capture: type, size, content hash, timestamps,
//! permission encoding, ownership and ACL entries.

use crate::acl::{AclEntry, AclProvider, NoAcl};
use crate::{Error, Result};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Read size used when hashing file content (1 MiB)
pub const DEFAULT_HASH_CHUNK: usize = 1024 * 1024;

/// What kind of filesystem object an item is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
    Symlink,
}

impl ItemKind {
    /// Single-letter code stored in the catalog
    pub fn code(&self) -> &'static str {
        match self {
            ItemKind::File => "f",
            ItemKind::Directory => "d",
            ItemKind::Symlink => "l",
        }
    }

    fn type_char(&self) -> char {
        match self {
            ItemKind::File => '-',
            ItemKind::Directory => 'd',
            ItemKind::Symlink => 'l',
        }
    }
}

/// Owner or group of an item: the symbolic name when it resolves, the raw id otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Principal {
    Name(String),
    Id(u32),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Name(name) => write!(f, "{}", name),
            Principal::Id(id) => write!(f, "{}", id),
        }
    }
}

/// The twelve permission bits of a mode, decoded per group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode {
    bits: u32,
}

const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_ISVTX: u32 = 0o1000;

impl FileMode {
    /// Keep the permission bits of a raw `st_mode`
    pub fn from_mode(mode: u32) -> Self {
        Self { bits: mode & 0o7777 }
    }

    /// Parse a 4-digit octal string such as `0755`
    pub fn from_octal(octal: &str) -> Option<Self> {
        if octal.len() != 4 {
            return None;
        }

        let mut bits = 0u32;
        for c in octal.chars() {
            let digit = c.to_digit(8)?;
            bits = (bits << 3) | digit;
        }
        Some(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn has(&self, flag: u32) -> bool {
        self.bits & flag != 0
    }

    /// Special, owner, group and other digits, each summed from 4/2/1 flags
    pub fn digits(&self) -> [u32; 4] {
        let weigh = |flags: [(u32, u32); 3]| -> u32 {
            flags
                .iter()
                .filter(|(flag, _)| self.has(*flag))
                .map(|(_, weight)| weight)
                .sum()
        };

        [
            weigh([(S_ISUID, 4), (S_ISGID, 2), (S_ISVTX, 1)]),
            weigh([(0o400, 4), (0o200, 2), (0o100, 1)]),
            weigh([(0o040, 4), (0o020, 2), (0o010, 1)]),
            weigh([(0o004, 4), (0o002, 2), (0o001, 1)]),
        ]
    }

    /// Four-digit octal rendering, e.g. `4755`
    pub fn octal(&self) -> String {
        self.digits().iter().map(|d| d.to_string()).collect()
    }

    /// Ten-character rendering with a leading type character.
    ///
    /// An execute bit wins over the special bit in its triplet: set-id without
    /// execute shows `S`, sticky without execute shows `T`.
    pub fn symbolic(&self, kind: ItemKind) -> String {
        let mut out = String::with_capacity(10);
        out.push(kind.type_char());

        let triplets = [
            (0o400, 0o200, 0o100, S_ISUID, 'S'),
            (0o040, 0o020, 0o010, S_ISGID, 'S'),
            (0o004, 0o002, 0o001, S_ISVTX, 'T'),
        ];

        for (read, write, exec, special, marker) in triplets {
            out.push(if self.has(read) { 'r' } else { '-' });
            out.push(if self.has(write) { 'w' } else { '-' });
            out.push(if self.has(exec) {
                'x'
            } else if self.has(special) {
                marker
            } else {
                '-'
            });
        }

        out
    }
}

/// Permission encoding stored with each item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub octal: String,
    pub symbolic: String,
}

/// Everything captured about one filesystem object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub path: PathBuf,
    pub kind: ItemKind,
    /// Size in bytes (files only)
    pub size: Option<u64>,
    /// Hex BLAKE3 digest of the content (files only)
    pub hash: Option<String>,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub mode: Option<Permissions>,
    pub owner: Option<Principal>,
    pub group: Option<Principal>,
    /// Link target (symlinks only)
    pub link_target: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acl: Vec<AclEntry>,
}

/// Computes [`Item`]s for paths
pub struct MetadataExtractor {
    acl: Box<dyn AclProvider>,
    chunk_size: usize,
}

impl MetadataExtractor {
    pub fn new(acl: Box<dyn AclProvider>) -> Self {
        Self {
            acl,
            chunk_size: DEFAULT_HASH_CHUNK,
        }
    }

    /// Set custom hashing read size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Capture the attributes of `path` without following a final symlink
    pub fn compute<P: AsRef<Path>>(&self, path: P) -> Result<Item> {
        let path = path.as_ref();
        let metadata = fs::symlink_metadata(path).map_err(|e| scan_error(path, e))?;
        let file_type = metadata.file_type();

        let (kind, size, hash, link_target) = if file_type.is_dir() {
            (ItemKind::Directory, None, None, None)
        } else if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| scan_error(path, e))?;
            (ItemKind::Symlink, None, None, Some(target))
        } else if file_type.is_file() {
            let hash = hash_file(path, self.chunk_size).map_err(|e| scan_error(path, e))?;
            (ItemKind::File, Some(metadata.len()), Some(hash), None)
        } else {
            // FIFOs, sockets and devices are never opened
            return Err(Error::Scan {
                path: path.to_path_buf(),
                reason: "unsupported file type".to_string(),
            });
        };

        let (atime, mtime, ctime) = timestamps(&metadata);
        let (mode, owner, group) = ownership(&metadata, kind);
        let acl = match kind {
            ItemKind::Symlink => Vec::new(),
            _ => self.acl.entries(path),
        };

        Ok(Item {
            path: path.to_path_buf(),
            kind,
            size,
            hash,
            atime,
            mtime,
            ctime,
            mode,
            owner,
            group,
            link_target,
            acl,
        })
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new(Box::new(NoAcl))
    }
}

fn scan_error(path: &Path, e: io::Error) -> Error {
    Error::Scan {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Hash everything `reader` yields, reading `chunk_size` bytes at a time
pub fn hash_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<String> {
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Streaming BLAKE3 digest of a file
pub fn hash_file<P: AsRef<Path>>(path: P, chunk_size: usize) -> io::Result<String> {
    hash_reader(File::open(path)?, chunk_size)
}

#[cfg(unix)]
fn timestamps(metadata: &Metadata) -> (i64, i64, i64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.atime(), metadata.mtime(), metadata.ctime())
}

#[cfg(not(unix))]
fn timestamps(metadata: &Metadata) -> (i64, i64, i64) {
    use std::time::{SystemTime, UNIX_EPOCH};

    let secs = |t: io::Result<SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    };
    let modified = secs(metadata.modified());
    // No inode change time here; creation time is the closest stand-in.
    (secs(metadata.accessed()), modified, secs(metadata.created()))
}

#[cfg(unix)]
fn ownership(
    metadata: &Metadata,
    kind: ItemKind,
) -> (Option<Permissions>, Option<Principal>, Option<Principal>) {
    use std::os::unix::fs::MetadataExt;

    let mode = FileMode::from_mode(metadata.mode());
    let permissions = Permissions {
        octal: mode.octal(),
        symbolic: mode.symbolic(kind),
    };

    let owner = users::user_name(metadata.uid())
        .map(Principal::Name)
        .unwrap_or(Principal::Id(metadata.uid()));
    let group = users::group_name(metadata.gid())
        .map(Principal::Name)
        .unwrap_or(Principal::Id(metadata.gid()));

    (Some(permissions), Some(owner), Some(group))
}

#[cfg(not(unix))]
fn ownership(
    _metadata: &Metadata,
    _kind: ItemKind,
) -> (Option<Permissions>, Option<Principal>, Option<Principal>) {
    (None, None, None)
}

#[cfg(unix)]
mod users {
    //! Reentrant passwd/group lookups.

    use std::ffi::CStr;
    use std::ptr;

    const MAX_BUFFER: usize = 1 << 20;

    pub fn user_name(uid: u32) -> Option<String> {
        let mut size = 1024;
        loop {
            let mut buf = vec![0 as libc::c_char; size];
            // SAFETY: zeroed passwd is a valid out-parameter for getpwuid_r.
            let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = ptr::null_mut();

            // SAFETY: all pointers reference live buffers of the advertised size.
            let rc = unsafe {
                libc::getpwuid_r(uid as libc::uid_t, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
            };

            if rc == libc::ERANGE && size < MAX_BUFFER {
                size *= 2;
                continue;
            }
            if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
                return None;
            }

            // SAFETY: pw_name points into `buf`, which is still alive.
            let name = unsafe { CStr::from_ptr(pwd.pw_name) };
            return Some(name.to_string_lossy().into_owned());
        }
    }

    pub fn group_name(gid: u32) -> Option<String> {
        let mut size = 1024;
        loop {
            let mut buf = vec![0 as libc::c_char; size];
            // SAFETY: zeroed group is a valid out-parameter for getgrgid_r.
            let mut grp: libc::group = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::group = ptr::null_mut();

            // SAFETY: all pointers reference live buffers of the advertised size.
            let rc = unsafe {
                libc::getgrgid_r(gid as libc::gid_t, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
            };

            if rc == libc::ERANGE && size < MAX_BUFFER {
                size *= 2;
                continue;
            }
            if rc != 0 || result.is_null() || grp.gr_name.is_null() {
                return None;
            }

            // SAFETY: gr_name points into `buf`, which is still alive.
            let name = unsafe { CStr::from_ptr(grp.gr_name) };
            return Some(name.to_string_lossy().into_owned());
        }
    }
}

/// Create a FIFO at `path`
#[cfg(all(test, unix))]
pub(crate) fn make_fifo(path: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
