use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveFormat;
use crate::requirement::{Capability, Requirement};
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: Version,
    pub release: Version,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: impl Into<Version>, release: impl Into<Version>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            release: release.into(),
        }
    }

    /// Orders by version first, then release, ignoring the name.
    pub fn cmp_evr(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.release.cmp(&other.release))
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.name, self.version, self.release)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub checksum: String,
    pub size: u64,
}

impl FileEntry {
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: normalize_entry_path(&path.into()),
            is_dir: true,
            checksum: String::new(),
            size: 0,
        }
    }

    pub fn symlink(path: impl Into<String>) -> Self {
        Self {
            path: normalize_entry_path(&path.into()),
            is_dir: false,
            checksum: String::new(),
            size: 0,
        }
    }

    pub fn file(path: impl Into<String>, checksum: impl Into<String>, size: u64) -> Self {
        Self {
            path: normalize_entry_path(&path.into()),
            is_dir: false,
            checksum: checksum.into(),
            size,
        }
    }

    pub fn is_symlink(&self) -> bool {
        !self.is_dir && self.checksum.is_empty()
    }

    /// Path relative to the site root, without the leading `/`.
    pub fn relative_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

fn normalize_entry_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches("./").trim_start_matches('/');
    let trimmed = trimmed.trim_end_matches('/');
    format!("/{trimmed}")
}

/// A concrete package as described by a repository or recorded as installed.
///
/// Identity is the `PackageId`; the remaining fields never take part in
/// equality, hashing or ordering.
#[derive(Debug, Clone)]
pub struct PackageRef {
    pub id: PackageId,
    pub requires: Vec<Requirement>,
    pub provides: Vec<Capability>,
    pub file_manifest: Vec<FileEntry>,
    pub post_install_script: Option<Vec<u8>>,
    pub download_url: String,
    pub sha256: Option<String>,
    pub archive: ArchiveFormat,
}

impl PackageRef {
    pub fn new(id: PackageId) -> Self {
        Self {
            id,
            requires: Vec::new(),
            provides: Vec::new(),
            file_manifest: Vec::new(),
            post_install_script: None,
            download_url: String::new(),
            sha256: None,
            archive: ArchiveFormat::TarGz,
        }
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn version(&self) -> &Version {
        &self.id.version
    }

    pub fn release(&self) -> &Version {
        &self.id.release
    }

    /// True when this package, by name or through a `provides` entry,
    /// satisfies `requirement`.
    pub fn fulfills(&self, requirement: &Requirement) -> bool {
        if self.id.name == requirement.name
            && requirement.matches_version(&self.id.version, &self.id.release)
        {
            return true;
        }
        self.provides
            .iter()
            .any(|capability| requirement.matches_capability(capability))
    }

    pub fn file_name(&self) -> String {
        let without_query = self
            .download_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        match without_query.rsplit('/').next() {
            Some(segment) if !segment.is_empty() => segment.to_string(),
            _ => format!("{}.{}", self.id, self.archive.cache_extension()),
        }
    }
}

impl PartialEq for PackageRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PackageRef {}

impl Hash for PackageRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for PackageRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}
