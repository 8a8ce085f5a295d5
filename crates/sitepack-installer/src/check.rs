use anyhow::Result;
use sitepack_core::{FileEntry, InstalledRecord, PackageId};
use sitepack_security::sha256_file;
use std::fmt;
use std::fs;

use crate::layout::SiteLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileProblem {
    MissingDirectory,
    MissingLink,
    MissingFile,
    WrongKind,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch,
}

impl fmt::Display for FileProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDirectory => f.write_str("directory does not exist"),
            Self::MissingLink => f.write_str("link does not exist"),
            Self::MissingFile => f.write_str("file does not exist"),
            Self::WrongKind => f.write_str("path has the wrong file type"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "file size is incorrect (expected {expected}, found {actual})")
            }
            Self::ChecksumMismatch => f.write_str("checksum is incorrect"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckProblem {
    pub package: PackageId,
    pub path: String,
    pub problem: FileProblem,
}

impl fmt::Display for CheckProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.package, self.path, self.problem)
    }
}

/// Compares every manifest entry of `record` against the site root.
pub fn check_record(layout: &SiteLayout, record: &InstalledRecord) -> Result<Vec<CheckProblem>> {
    let mut problems = Vec::new();
    for entry in record.files() {
        if let Some(problem) = check_entry(layout, entry, true)? {
            problems.push(CheckProblem {
                package: record.id().clone(),
                path: entry.path.clone(),
                problem,
            });
        }
    }
    Ok(problems)
}

/// Existence and size of freshly extracted files.
pub fn check_file_sizes(
    layout: &SiteLayout,
    package: &PackageId,
    files: &[FileEntry],
) -> Result<Vec<CheckProblem>> {
    let mut problems = Vec::new();
    for entry in files {
        if let Some(problem) = check_entry(layout, entry, false)? {
            problems.push(CheckProblem {
                package: package.clone(),
                path: entry.path.clone(),
                problem,
            });
        }
    }
    Ok(problems)
}

fn check_entry(
    layout: &SiteLayout,
    entry: &FileEntry,
    verify_checksum: bool,
) -> Result<Option<FileProblem>> {
    let path = layout.entry_path(entry);
    let metadata = fs::symlink_metadata(&path);

    if entry.is_dir {
        return Ok(match metadata {
            Err(_) => Some(FileProblem::MissingDirectory),
            Ok(_) if !path.is_dir() => Some(FileProblem::WrongKind),
            Ok(_) => None,
        });
    }

    if entry.is_symlink() {
        return Ok(match metadata {
            Err(_) => Some(FileProblem::MissingLink),
            Ok(meta) if !meta.file_type().is_symlink() => Some(FileProblem::WrongKind),
            Ok(_) => None,
        });
    }

    let meta = match metadata {
        Err(_) => return Ok(Some(FileProblem::MissingFile)),
        Ok(meta) if !meta.is_file() => return Ok(Some(FileProblem::WrongKind)),
        Ok(meta) => meta,
    };
    if meta.len() != entry.size {
        return Ok(Some(FileProblem::SizeMismatch {
            expected: entry.size,
            actual: meta.len(),
        }));
    }
    if verify_checksum && !sha256_file(&path)?.eq_ignore_ascii_case(&entry.checksum) {
        return Ok(Some(FileProblem::ChecksumMismatch));
    }
    Ok(None)
}
