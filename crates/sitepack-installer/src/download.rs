use anyhow::{anyhow, bail, Context, Result};
use sitepack_core::{PackageId, PackageRef};
use sitepack_security::verify_sha256_file;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::extract::Extractor;
use crate::fs_utils::remove_file_if_exists;

pub const DEFAULT_WORKERS: usize = 5;
pub const DOWNLOAD_ATTEMPTS: usize = 2;

/// Transfers one URL to a local file.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, destination: &Path) -> Result<()>;
}

/// `http(s)://` through a blocking reqwest client; `file://` URLs and plain
/// paths are copied.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("sitepack/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<()> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let mut response = self
                .client
                .get(url)
                .send()
                .with_context(|| format!("request failed: {url}"))?
                .error_for_status()
                .with_context(|| format!("server rejected download: {url}"))?;
            let file = File::create(destination)
                .with_context(|| format!("failed to create {}", destination.display()))?;
            let mut writer = BufWriter::new(file);
            response
                .copy_to(&mut writer)
                .with_context(|| format!("failed to download {url}"))?;
            return Ok(());
        }

        let source = url.strip_prefix("file://").unwrap_or(url);
        fs::copy(source, destination).with_context(|| {
            format!("failed to copy {source} to {}", destination.display())
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSource {
    Cache,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub source: ArtifactSource,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub artifacts: BTreeMap<PackageId, Artifact>,
    pub failures: BTreeMap<PackageId, String>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Stages package archives into a download directory, reusing cached
/// copies and fetching the rest on a fixed pool of worker threads.
pub struct DownloadManager<'a> {
    fetcher: &'a dyn Fetcher,
    validator: &'a dyn Extractor,
    download_dir: PathBuf,
    cache_dirs: Vec<PathBuf>,
    workers: usize,
}

impl<'a> DownloadManager<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        validator: &'a dyn Extractor,
        download_dir: impl Into<PathBuf>,
        cache_dirs: Vec<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            fetcher,
            validator,
            download_dir: download_dir.into(),
            cache_dirs,
            workers: workers.max(1),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Returns once every package has either an artifact or a failure.
    pub fn fetch(&self, packages: &[PackageRef]) -> Result<DownloadReport> {
        fs::create_dir_all(&self.download_dir).with_context(|| {
            format!(
                "failed to create download dir: {}",
                self.download_dir.display()
            )
        })?;

        let mut report = DownloadReport::default();
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        for package in packages {
            if !seen.insert(&package.id) {
                continue;
            }
            if let Some(path) = self.find_cached(package) {
                debug!(package = %package.id, path = %path.display(), "using cached artifact");
                report.artifacts.insert(
                    package.id.clone(),
                    Artifact {
                        path,
                        source: ArtifactSource::Cache,
                    },
                );
            } else {
                pending.push(package);
            }
        }

        if pending.is_empty() {
            return Ok(report);
        }

        let worker_count = self.workers.min(pending.len());
        info!(
            packages = pending.len(),
            workers = worker_count,
            "downloading packages"
        );

        let (task_tx, task_rx) = mpsc::sync_channel::<&PackageRef>(worker_count);
        let task_rx = Mutex::new(task_rx);
        let (result_tx, result_rx) = mpsc::channel::<(PackageId, Result<PathBuf>)>();

        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let task_rx = &task_rx;
                let result_tx = result_tx.clone();
                scope.spawn(move || loop {
                    let next = match task_rx.lock() {
                        Ok(receiver) => receiver.recv(),
                        Err(_) => break,
                    };
                    let Ok(package) = next else {
                        break;
                    };
                    let outcome = self.download_with_retry(package);
                    if result_tx.send((package.id.clone(), outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(result_tx);

            for package in pending.iter().copied() {
                if task_tx.send(package).is_err() {
                    break;
                }
            }
            drop(task_tx);
        });

        for (id, outcome) in result_rx.iter() {
            match outcome {
                Ok(path) => {
                    report.artifacts.insert(
                        id,
                        Artifact {
                            path,
                            source: ArtifactSource::Downloaded,
                        },
                    );
                }
                Err(err) => {
                    warn!(package = %id, error = %format!("{err:#}"), "download failed");
                    report.failures.insert(id, format!("{err:#}"));
                }
            }
        }

        for package in pending {
            if !report.artifacts.contains_key(&package.id)
                && !report.failures.contains_key(&package.id)
            {
                report
                    .failures
                    .insert(package.id.clone(), "download worker exited".to_string());
            }
        }

        Ok(report)
    }

    fn find_cached(&self, package: &PackageRef) -> Option<PathBuf> {
        let file_name = package.file_name();
        for cache_dir in &self.cache_dirs {
            for entry in WalkDir::new(cache_dir)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| entry.ok())
            {
                if !entry.file_type().is_file() || entry.file_name() != file_name.as_str() {
                    continue;
                }
                if self.validate(package, entry.path()).is_ok() {
                    return Some(entry.into_path());
                }
                debug!(path = %entry.path().display(), "ignoring invalid cached artifact");
            }
        }

        let staged = self.download_dir.join(&file_name);
        if staged.is_file() && self.validate(package, &staged).is_ok() {
            return Some(staged);
        }
        None
    }

    fn validate(&self, package: &PackageRef, path: &Path) -> Result<()> {
        match &package.sha256 {
            Some(expected) => {
                if !verify_sha256_file(path, expected)? {
                    bail!("sha256 mismatch for {} (expected {expected})", package.id);
                }
            }
            None => {
                if !self.validator.sanity_check(path) {
                    bail!("archive for {} failed the sanity check", package.id);
                }
            }
        }
        Ok(())
    }

    fn download_with_retry(&self, package: &PackageRef) -> Result<PathBuf> {
        if package.download_url.is_empty() {
            bail!("package {} has no download url", package.id);
        }

        let file_name = package.file_name();
        let destination = self.download_dir.join(&file_name);
        let tmp_path = self.download_dir.join(format!("{file_name}.tmp"));

        let mut last_error = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let outcome = self
                .fetcher
                .fetch(&package.download_url, &tmp_path)
                .and_then(|()| self.validate(package, &tmp_path));
            match outcome {
                Ok(()) => {
                    fs::rename(&tmp_path, &destination).with_context(|| {
                        format!(
                            "failed to move downloaded artifact into place: {}",
                            destination.display()
                        )
                    })?;
                    debug!(package = %package.id, attempt, "downloaded");
                    return Ok(destination);
                }
                Err(err) => {
                    warn!(
                        package = %package.id,
                        attempt,
                        error = %format!("{err:#}"),
                        "download attempt failed"
                    );
                    if let Err(cleanup) = remove_file_if_exists(&tmp_path) {
                        debug!(
                            path = %tmp_path.display(),
                            error = %cleanup,
                            "failed to remove partial download"
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("download of {} failed", package.id)))
    }
}
