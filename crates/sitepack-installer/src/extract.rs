use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use sitepack_core::FileEntry;
use sitepack_security::{sha256_file, sha256_reader};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;

use crate::fs_utils::remove_file_if_exists;

/// Archive member holding the post-install script. Never extracted.
pub const POST_INSTALL_ENTRY: &str = ".sitepack/post-install";
const METADATA_DIR: &str = ".sitepack";

pub trait Extractor: Send + Sync {
    /// Unpacks `archive` under `root` and returns what was placed there, in
    /// archive order. Without `overwrite`, existing files abort the
    /// extraction before anything is written.
    fn extract(&self, archive: &Path, root: &Path, overwrite: bool) -> Result<Vec<FileEntry>>;

    /// The manifest `extract` would produce, without touching disk.
    fn read_manifest(&self, archive: &Path) -> Result<Vec<FileEntry>>;

    fn post_install_script(&self, archive: &Path) -> Result<Option<Vec<u8>>>;

    /// Whether `archive` can be read end to end.
    fn sanity_check(&self, archive: &Path) -> bool;
}

/// Gzip-compressed or plain tar archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarGzExtractor;

impl TarGzExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut magic = [0_u8; 2];
    let mut probe =
        File::open(path).with_context(|| format!("failed to open archive: {}", path.display()))?;
    let read = probe
        .read(&mut magic)
        .with_context(|| format!("failed to read archive: {}", path.display()))?;

    let file =
        File::open(path).with_context(|| format!("failed to open archive: {}", path.display()))?;
    let reader: Box<dyn Read> = if read == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(tar::Archive::new(reader))
}

fn looks_like_archive(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut header = [0_u8; 262];
    let Ok(read) = file.read(&mut header) else {
        return false;
    };
    if read >= 2 && header[..2] == [0x1f, 0x8b] {
        return true;
    }
    read == header.len() && &header[257..262] == b"ustar"
}

/// Site-root relative path of an archive member, or `None` for the root
/// itself. Absolute and parent-escaping paths are rejected.
pub(crate) fn entry_relative_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                bail!("archive entry escapes the site root: {}", raw.display())
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("archive entry has an absolute path: {}", raw.display())
            }
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

/// Fails when an existing ancestor of `relative` under `root` is a symlink
/// resolving outside `canonical_root`.
fn ensure_parents_inside(root: &Path, canonical_root: &Path, relative: &Path) -> Result<()> {
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        let Ok(metadata) = fs::symlink_metadata(&current) else {
            // Missing from here down; create_dir_all makes plain directories.
            break;
        };
        if !metadata.file_type().is_symlink() {
            continue;
        }
        let target = fs::canonicalize(&current).with_context(|| {
            format!(
                "archive entry {} goes through a dangling symlink",
                relative.display()
            )
        })?;
        if !target.starts_with(canonical_root) {
            bail!(
                "archive entry {} goes through a symlink leaving the site root: {}",
                relative.display(),
                current.display()
            );
        }
    }
    Ok(())
}

fn is_reserved(relative: &Path) -> bool {
    relative.starts_with(METADATA_DIR)
}

enum MemberKind {
    Directory,
    Symlink,
    File,
}

fn member_kind(entry_type: EntryType, raw: &Path) -> Result<MemberKind> {
    if entry_type.is_dir() {
        Ok(MemberKind::Directory)
    } else if entry_type.is_symlink() {
        Ok(MemberKind::Symlink)
    } else if entry_type.is_file() {
        Ok(MemberKind::File)
    } else {
        Err(anyhow!(
            "unsupported archive entry type {:?}: {}",
            entry_type,
            raw.display()
        ))
    }
}

impl Extractor for TarGzExtractor {
    fn extract(&self, archive: &Path, root: &Path, overwrite: bool) -> Result<Vec<FileEntry>> {
        if !overwrite {
            let conflicts: Vec<String> = self
                .read_manifest(archive)?
                .into_iter()
                .filter(|entry| !entry.is_dir)
                .filter(|entry| {
                    fs::symlink_metadata(root.join(entry.relative_path())).is_ok()
                })
                .map(|entry| entry.path)
                .collect();
            if !conflicts.is_empty() {
                bail!(
                    "files already exist in the site root (use overwrite): {}",
                    conflicts.join(", ")
                );
            }
        }

        fs::create_dir_all(root)
            .with_context(|| format!("failed to create site root: {}", root.display()))?;

        let canonical_root = fs::canonicalize(root)
            .with_context(|| format!("failed to resolve site root: {}", root.display()))?;

        let mut reader = open_archive(archive)?;
        let mut files = Vec::new();
        for entry in reader
            .entries()
            .with_context(|| format!("failed to read archive: {}", archive.display()))?
        {
            let mut entry =
                entry.with_context(|| format!("corrupt archive: {}", archive.display()))?;
            let raw = entry.path()?.into_owned();
            let Some(relative) = entry_relative_path(&raw)? else {
                continue;
            };
            if is_reserved(&relative) {
                continue;
            }
            ensure_parents_inside(root, &canonical_root, &relative)?;

            let destination = root.join(&relative);
            let display = relative.to_string_lossy().to_string();
            match member_kind(entry.header().entry_type(), &raw)? {
                MemberKind::Directory => {
                    fs::create_dir_all(&destination).with_context(|| {
                        format!("failed to create directory: {}", destination.display())
                    })?;
                    files.push(FileEntry::directory(display));
                }
                MemberKind::Symlink | MemberKind::File => {
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent).with_context(|| {
                            format!("failed to create directory: {}", parent.display())
                        })?;
                    }
                    if let Ok(existing) = fs::symlink_metadata(&destination) {
                        if existing.is_dir() && !existing.file_type().is_symlink() {
                            bail!(
                                "cannot replace directory with file: {}",
                                destination.display()
                            );
                        }
                        remove_file_if_exists(&destination).with_context(|| {
                            format!("failed to replace {}", destination.display())
                        })?;
                    }
                    let expected_size = entry.header().size()?;
                    entry.unpack(&destination).with_context(|| {
                        format!("failed to extract {}", destination.display())
                    })?;

                    if entry.header().entry_type().is_symlink() {
                        files.push(FileEntry::symlink(display));
                    } else {
                        files.push(FileEntry::file(
                            display,
                            sha256_file(&destination)?,
                            expected_size,
                        ));
                    }
                }
            }
        }
        Ok(files)
    }

    fn read_manifest(&self, archive: &Path) -> Result<Vec<FileEntry>> {
        let mut reader = open_archive(archive)?;
        let mut files = Vec::new();
        for entry in reader
            .entries()
            .with_context(|| format!("failed to read archive: {}", archive.display()))?
        {
            let mut entry =
                entry.with_context(|| format!("corrupt archive: {}", archive.display()))?;
            let raw = entry.path()?.into_owned();
            let Some(relative) = entry_relative_path(&raw)? else {
                continue;
            };
            if is_reserved(&relative) {
                continue;
            }

            let display = relative.to_string_lossy().to_string();
            match member_kind(entry.header().entry_type(), &raw)? {
                MemberKind::Directory => files.push(FileEntry::directory(display)),
                MemberKind::Symlink => files.push(FileEntry::symlink(display)),
                MemberKind::File => {
                    let size = entry.header().size()?;
                    let checksum = sha256_reader(&mut entry)
                        .with_context(|| format!("failed to read archive member {display}"))?;
                    files.push(FileEntry::file(display, checksum, size));
                }
            }
        }
        Ok(files)
    }

    fn post_install_script(&self, archive: &Path) -> Result<Option<Vec<u8>>> {
        let mut reader = open_archive(archive)?;
        for entry in reader
            .entries()
            .with_context(|| format!("failed to read archive: {}", archive.display()))?
        {
            let mut entry =
                entry.with_context(|| format!("corrupt archive: {}", archive.display()))?;
            let raw = entry.path()?.into_owned();
            if entry_relative_path(&raw)?.as_deref() != Some(Path::new(POST_INSTALL_ENTRY)) {
                continue;
            }
            let mut script = Vec::new();
            entry
                .read_to_end(&mut script)
                .context("failed to read post-install script")?;
            return Ok(Some(script));
        }
        Ok(None)
    }

    fn sanity_check(&self, archive: &Path) -> bool {
        if !looks_like_archive(archive) {
            return false;
        }
        let Ok(mut reader) = open_archive(archive) else {
            return false;
        };
        let Ok(entries) = reader.entries() else {
            return false;
        };
        for entry in entries {
            let Ok(mut entry) = entry else {
                return false;
            };
            if io::copy(&mut entry, &mut io::sink()).is_err() {
                return false;
            }
        }
        true
    }
}
