use anyhow::{bail, Context, Result};
use sitepack_core::{
    ArchiveFormat, Capability, FileEntry, InstalledRecord, LocalInventory, PackageId, PackageRef,
    PostInstallStatus, Requirement,
};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::fs_utils::{remove_file_if_exists, unix_now};
use crate::layout::SiteLayout;

/// Installed-package store kept as receipt files under the site root.
///
/// Each package gets `<id>.receipt` (line-oriented `key=value`) and
/// `<id>.files` (one tab-separated manifest entry per line).
#[derive(Debug, Clone)]
pub struct ReceiptInventory {
    layout: SiteLayout,
}

impl ReceiptInventory {
    pub fn new(layout: SiteLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn write_receipt(&self, record: &InstalledRecord) -> Result<PathBuf> {
        let path = self.layout.receipt_path(record.id());
        fs::write(&path, render_receipt(record).as_bytes())
            .with_context(|| format!("failed to write install receipt: {}", path.display()))?;
        Ok(path)
    }

    fn read_record(&self, path: &std::path::Path) -> Result<InstalledRecord> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read install receipt: {}", path.display()))?;
        let mut record = parse_receipt(&raw)
            .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;

        let files_path = self.layout.files_path(record.id());
        match fs::read_to_string(&files_path) {
            Ok(raw) => {
                record.package.file_manifest = parse_file_manifest(&raw).with_context(|| {
                    format!("failed to parse file manifest: {}", files_path.display())
                })?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read file manifest: {}", files_path.display())
                });
            }
        }
        Ok(record)
    }
}

impl LocalInventory for ReceiptInventory {
    fn installed_records(&self) -> Result<Vec<InstalledRecord>> {
        let dir = self.layout.installed_state_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read install state directory: {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some("receipt") {
                continue;
            }
            records.push(self.read_record(&path)?);
        }

        records.sort_by(|a, b| a.package.cmp(&b.package));
        Ok(records)
    }

    fn add_record(&self, package: &PackageRef, files: Vec<FileEntry>) -> Result<InstalledRecord> {
        let receipt_path = self.layout.receipt_path(&package.id);
        if receipt_path.exists() {
            bail!("package {} is already recorded as installed", package.id);
        }
        let dir = self.layout.installed_state_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut package = package.clone();
        package.file_manifest = files;
        let record = InstalledRecord {
            package,
            post_install: PostInstallStatus::NotRun,
            installed_at_unix: unix_now(),
        };

        let files_path = self.layout.files_path(record.id());
        fs::write(&files_path, render_file_manifest(record.files()).as_bytes())
            .with_context(|| format!("failed to write file manifest: {}", files_path.display()))?;
        self.write_receipt(&record)?;
        debug!(package = %record.id(), files = record.files().len(), "recorded install");
        Ok(record)
    }

    fn remove_record(&self, id: &PackageId) -> Result<()> {
        let receipt_path = self.layout.receipt_path(id);
        remove_file_if_exists(&receipt_path).with_context(|| {
            format!(
                "failed to remove install receipt: {}",
                receipt_path.display()
            )
        })?;
        let files_path = self.layout.files_path(id);
        remove_file_if_exists(&files_path).with_context(|| {
            format!("failed to remove file manifest: {}", files_path.display())
        })?;
        Ok(())
    }

    fn set_post_install_status(&self, id: &PackageId, status: PostInstallStatus) -> Result<()> {
        let path = self.layout.receipt_path(id);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read install receipt: {}", path.display()))?;
        let mut record = parse_receipt(&raw)
            .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
        record.post_install = status;
        self.write_receipt(&record)?;
        Ok(())
    }
}

pub(crate) fn render_receipt(record: &InstalledRecord) -> String {
    let package = &record.package;
    let mut payload = String::new();
    payload.push_str(&format!("name={}\n", package.id.name));
    payload.push_str(&format!("version={}\n", package.id.version));
    payload.push_str(&format!("release={}\n", package.id.release));
    for requirement in &package.requires {
        payload.push_str(&format!("require={}\n", requirement));
    }
    for capability in &package.provides {
        payload.push_str(&format!("provide={}\n", capability));
    }
    if !package.download_url.is_empty() {
        payload.push_str(&format!("url={}\n", package.download_url));
    }
    if let Some(sha256) = &package.sha256 {
        payload.push_str(&format!("sha256={}\n", sha256));
    }
    payload.push_str(&format!("archive={}\n", package.archive.as_str()));
    payload.push_str(&format!("post_install={}\n", record.post_install.as_str()));
    payload.push_str(&format!("installed_at_unix={}\n", record.installed_at_unix));
    payload
}

pub(crate) fn parse_receipt(raw: &str) -> Result<InstalledRecord> {
    let mut name = None;
    let mut version = None;
    let mut release = None;
    let mut requires = Vec::new();
    let mut provides = Vec::new();
    let mut url = None;
    let mut sha256 = None;
    let mut archive = None;
    let mut post_install = None;
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "name" => name = Some(v.to_string()),
            "version" => version = Some(v.to_string()),
            "release" => release = Some(v.to_string()),
            "require" => requires.push(Requirement::parse(v)?),
            "provide" => provides.push(Capability::parse(v)?),
            "url" => url = Some(v.to_string()),
            "sha256" => sha256 = Some(v.to_string()),
            "archive" => archive = ArchiveFormat::parse(v),
            "post_install" => {
                post_install = Some(
                    PostInstallStatus::parse(v)
                        .with_context(|| format!("unknown post_install status '{v}'"))?,
                )
            }
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    let mut package = PackageRef::new(PackageId::new(
        name.context("missing name")?,
        version.context("missing version")?,
        release.unwrap_or_default(),
    ));
    package.requires = requires;
    package.provides = provides;
    package.download_url = url.unwrap_or_default();
    package.sha256 = sha256;
    package.archive = archive.unwrap_or_default();

    Ok(InstalledRecord {
        package,
        post_install: post_install.unwrap_or_default(),
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}

pub(crate) fn render_file_manifest(files: &[FileEntry]) -> String {
    let mut payload = String::new();
    for entry in files {
        let kind = if entry.is_dir {
            "d"
        } else if entry.is_symlink() {
            "l"
        } else {
            "f"
        };
        let checksum = if entry.checksum.is_empty() {
            "-"
        } else {
            entry.checksum.as_str()
        };
        payload.push_str(&format!(
            "{kind}\t{}\t{checksum}\t{}\n",
            entry.size, entry.path
        ));
    }
    payload
}

pub(crate) fn parse_file_manifest(raw: &str) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, '\t');
        let (Some(kind), Some(size), Some(checksum), Some(path)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            bail!("malformed file manifest line {}", index + 1);
        };
        let size: u64 = size
            .parse()
            .with_context(|| format!("invalid size on file manifest line {}", index + 1))?;
        let entry = match kind {
            "d" => FileEntry::directory(path),
            "l" => FileEntry::symlink(path),
            "f" => FileEntry::file(path, if checksum == "-" { "" } else { checksum }, size),
            other => bail!("unknown entry kind '{other}' on line {}", index + 1),
        };
        files.push(entry);
    }
    Ok(files)
}
