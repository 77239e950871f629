//! ACL capture as a platform capability.
//!
//! The snapshot core only talks to [`AclProvider`]. POSIX systems list extended
//! entries through `getfacl`; everything else gets [`NoAcl`], which reports an
//! empty set because the capability is not implemented there.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Whether an ACL entry grants rights to a user or to a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Group,
}

impl SubjectKind {
    /// Single-letter code stored in the catalog
    pub fn code(&self) -> &'static str {
        match self {
            SubjectKind::User => "u",
            SubjectKind::Group => "g",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKind::User => write!(f, "user"),
            SubjectKind::Group => write!(f, "group"),
        }
    }
}

/// One named user or group entry of an access control list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// User or group id as reported by the platform
    pub subject: String,
    pub kind: SubjectKind,
    /// Permission string, e.g. `rw-`
    pub perms: String,
}

/// Source of extended ACL entries for a path
pub trait AclProvider: Send + Sync {
    /// Return the named user/group entries of `path`.
    ///
    /// Failures are not errors: implementations log and return an empty set.
    fn entries(&self, path: &Path) -> Vec<AclEntry>;
}

/// Provider for platforms without ACL support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAcl;

impl AclProvider for NoAcl {
    fn entries(&self, _path: &Path) -> Vec<AclEntry> {
        Vec::new()
    }
}

/// POSIX provider backed by the `getfacl` utility
#[derive(Debug, Clone)]
pub struct PosixAcl {
    program: PathBuf,
}

impl PosixAcl {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("getfacl"),
        }
    }

    /// Use a different listing binary (mainly for tests and odd installs)
    pub fn with_program<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }
}

impl Default for PosixAcl {
    fn default() -> Self {
        Self::new()
    }
}

impl AclProvider for PosixAcl {
    fn entries(&self, path: &Path) -> Vec<AclEntry> {
        let output = match Command::new(&self.program)
            .arg("--numeric")
            .arg("--omit-header")
            .arg("--physical")
            .arg(path)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!("Unable to run {} for {}: {}", self.program.display(), path.display(), e);
                return Vec::new();
            }
        };

        if !output.status.success() {
            warn!(
                "ACL listing failed for {} ({}): {}",
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Vec::new();
        }

        let entries = parse_getfacl(&String::from_utf8_lossy(&output.stdout));
        debug!("{} ACL entries for {}", entries.len(), path.display());
        entries
    }
}

/// Parse `getfacl` output, keeping only named `user:` and `group:` entries.
///
/// Owner (`user::`), owning group (`group::`), `mask`, `other` and `default:`
/// lines are part of the regular mode or of inheritance and are skipped.
pub fn parse_getfacl(output: &str) -> Vec<AclEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        // "user:1000:rwx\t#effective:r-x"
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.splitn(3, ':');
        let (tag, subject, perms) = match (fields.next(), fields.next(), fields.next()) {
            (Some(tag), Some(subject), Some(perms)) => (tag, subject, perms.trim()),
            _ => continue,
        };

        if subject.is_empty() {
            continue;
        }

        let kind = match tag {
            "user" => SubjectKind::User,
            "group" => SubjectKind::Group,
            _ => continue,
        };

        entries.push(AclEntry {
            subject: subject.to_string(),
            kind,
            perms: perms.to_string(),
        });
    }

    entries
}

/// Pick the provider for the running platform.
///
/// With `enabled == false` no ACLs are captured at all.
pub fn platform_provider(enabled: bool) -> Box<dyn AclProvider> {
    if !enabled {
        return Box::new(NoAcl);
    }

    #[cfg(all(unix, feature = "posix-acl"))]
    {
        Box::new(PosixAcl::new())
    }

    #[cfg(not(all(unix, feature = "posix-acl")))]
    {
        Box::new(NoAcl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_named_entries_only() {
        let output = "user::rw-\n\
                      user:1001:r-x\t#effective:r--\n\
                      group::r--\n\
                      group:50:rw-\n\
                      mask::r--\n\
                      other::---\n\
                      default:user:1002:rwx\n";

        let entries = parse_getfacl(output);
        assert_eq!(
            entries,
            vec![
                AclEntry {
                    subject: "1001".to_string(),
                    kind: SubjectKind::User,
                    perms: "r-x".to_string(),
                },
                AclEntry {
                    subject: "50".to_string(),
                    kind: SubjectKind::Group,
                    perms: "rw-".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_ignores_garbage() {
        assert!(parse_getfacl("").is_empty());
        assert!(parse_getfacl("# file: tmp\nnonsense\n").is_empty());
    }

    #[test]
    fn test_missing_program_yields_empty_set() {
        let provider = PosixAcl::with_program("/nonexistent/getfacl-for-tests");
        assert!(provider.entries(Path::new("/")).is_empty());
    }

    #[test]
    fn test_disabled_provider_is_noop() {
        let provider = platform_provider(false);
        assert!(provider.entries(Path::new("/")).is_empty());
    }
}
