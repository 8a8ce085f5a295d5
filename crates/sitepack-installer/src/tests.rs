use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use sitepack_core::{
    InstalledFilter, LocalInventory, PackageId, PackageRef, PostInstallStatus, RepositoryClient,
    Requirement,
};
use sitepack_security::sha256_file;
use tempfile::TempDir;

use super::*;
use crate::extract::entry_relative_path;
use crate::inventory::{parse_file_manifest, parse_receipt, render_receipt};

enum Fixture<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Link(&'a str, &'a str),
}

fn build_archive(path: &Path, entries: &[Fixture<'_>]) {
    let file = File::create(path).expect("must create archive");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        match entry {
            Fixture::Dir(name) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, name, io::empty())
                    .expect("must append dir");
            }
            Fixture::File(name, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, name, *data)
                    .expect("must append file");
            }
            Fixture::Link(name, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder
                    .append_link(&mut header, name, target)
                    .expect("must append link");
            }
        }
    }
    builder
        .into_inner()
        .expect("must finish tar")
        .finish()
        .expect("must finish gzip");
}

#[derive(Default)]
struct FakeRepository {
    packages: Vec<PackageRef>,
}

impl RepositoryClient for FakeRepository {
    fn find_latest_matching(&self, requirement: &Requirement) -> Result<Option<PackageRef>> {
        Ok(self
            .packages
            .iter()
            .filter(|package| package.fulfills(requirement))
            .max_by(|left, right| left.id.cmp_evr(&right.id))
            .cloned())
    }

    fn list_provides(&self, name_pattern: &str) -> Result<Vec<PackageRef>> {
        Ok(self
            .packages
            .iter()
            .filter(|package| package.name().contains(name_pattern))
            .cloned()
            .collect())
    }
}

/// Copies `url` as a local path; each url can be made to fail a number of
/// times first.
#[derive(Clone, Default)]
struct FakeFetcher {
    calls: Arc<AtomicUsize>,
    failures: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeFetcher {
    fn fail(&self, url: &str, times: usize) {
        self.failures
            .lock()
            .expect("must lock")
            .insert(url.to_string(), times);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().map_err(|_| anyhow!("poisoned"))?;
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    fs::write(destination, b"partial")?;
                    return Err(anyhow!("connection reset: {url}"));
                }
            }
        }
        fs::copy(url, destination)?;
        Ok(())
    }
}

struct Site {
    _dir: TempDir,
    root: PathBuf,
    archives: PathBuf,
    repository: Vec<PackageRef>,
    fetcher: FakeFetcher,
}

impl Site {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let root = dir.path().join("site");
        let archives = dir.path().join("archives");
        fs::create_dir_all(&root).expect("must create site root");
        fs::create_dir_all(&archives).expect("must create archives dir");
        Self {
            _dir: dir,
            root,
            archives,
            repository: Vec::new(),
            fetcher: FakeFetcher::default(),
        }
    }

    fn publish(
        &mut self,
        name: &str,
        version: &str,
        requires: &[&str],
        entries: &[Fixture<'_>],
    ) -> PackageRef {
        let path = self.archives.join(format!("{name}-{version}-1.tar.gz"));
        build_archive(&path, entries);
        let mut package = PackageRef::new(PackageId::new(name, version, "1"));
        package.requires = requires
            .iter()
            .map(|raw| Requirement::parse(raw).expect("requirement must parse"))
            .collect();
        package.download_url = path.to_string_lossy().to_string();
        self.repository.push(package.clone());
        package
    }

    fn publish_libfoo(&mut self, version: &str) -> PackageRef {
        let lib = format!("libfoo {version}\n");
        self.publish(
            "libfoo",
            version,
            &[],
            &[
                Fixture::Dir("lib"),
                Fixture::File("lib/libfoo.so", lib.as_bytes()),
                Fixture::Link("lib/libfoo.so.1", "libfoo.so"),
                Fixture::Dir("share"),
                Fixture::File("share/libfoo.txt", b"docs\n"),
            ],
        )
    }

    fn publish_web_app(&mut self) -> PackageRef {
        self.publish(
            "web-app",
            "1.4",
            &["libfoo >= 2.0", "/bin/sh"],
            &[
                Fixture::Dir("bin"),
                Fixture::File("bin/web-app", b"#!/bin/sh\necho web\n"),
                Fixture::Dir("share"),
                Fixture::File("share/web-app.txt", b"web docs\n"),
            ],
        )
    }

    fn config(&self) -> InstallerConfig {
        InstallerConfig::for_root(&self.root)
    }

    fn installer(&self) -> Installer {
        self.installer_with(self.config())
    }

    fn installer_with(&self, config: InstallerConfig) -> Installer {
        Installer::new(
            config,
            Box::new(FakeRepository {
                packages: self.repository.clone(),
            }),
            Box::new(ReceiptInventory::new(SiteLayout::new(&self.root))),
            Box::new(TarGzExtractor::new()),
            Box::new(self.fetcher.clone()),
        )
    }

    fn inventory(&self) -> ReceiptInventory {
        ReceiptInventory::new(SiteLayout::new(&self.root))
    }

    fn installed_ids(&self) -> Vec<String> {
        self.inventory()
            .installed_records()
            .expect("must list installed")
            .iter()
            .map(|record| record.id().to_string())
            .collect()
    }
}

fn requirement(raw: &str) -> Requirement {
    Requirement::parse(raw).expect("requirement must parse")
}

#[test]
fn receipt_round_trip_keeps_metadata() {
    let mut package = PackageRef::new(PackageId::new("web-app", "1.4", "2"));
    package.requires = vec![requirement("libfoo >= 2.0")];
    package.provides = vec![sitepack_core::Capability::parse("web = 1.4").expect("must parse")];
    package.download_url = "https://example.test/web-app-1.4-2.tar.gz".to_string();
    package.sha256 = Some("ab".repeat(32));
    let record = sitepack_core::InstalledRecord {
        package,
        post_install: PostInstallStatus::Error,
        installed_at_unix: 1_700_000_000,
    };

    let parsed = parse_receipt(&render_receipt(&record)).expect("must parse receipt");
    assert_eq!(parsed.id(), record.id());
    assert_eq!(parsed.package.requires, record.package.requires);
    assert_eq!(parsed.package.provides, record.package.provides);
    assert_eq!(parsed.package.download_url, record.package.download_url);
    assert_eq!(parsed.package.sha256, record.package.sha256);
    assert_eq!(parsed.post_install, PostInstallStatus::Error);
    assert_eq!(parsed.installed_at_unix, 1_700_000_000);
}

#[test]
fn receipt_without_name_is_rejected() {
    let err = parse_receipt("version=1.0\ninstalled_at_unix=1\n").expect_err("must fail");
    assert!(err.to_string().contains("missing name"));
}

#[test]
fn malformed_file_manifest_line_is_rejected() {
    let err = parse_file_manifest("f\t12\n").expect_err("must fail");
    assert!(err.to_string().contains("line 1"));

    let files = parse_file_manifest("d\t0\t-\t/lib\nl\t0\t-\t/lib/a.so\n").expect("must parse");
    assert!(files[0].is_dir);
    assert!(files[1].is_symlink());
}

#[test]
fn extract_places_files_and_skips_metadata_entries() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let archive = dir.path().join("pkg.tar.gz");
    build_archive(
        &archive,
        &[
            Fixture::Dir("bin"),
            Fixture::File("bin/tool", b"tool\n"),
            Fixture::Link("bin/tool-link", "tool"),
            Fixture::Dir(".sitepack"),
            Fixture::File(POST_INSTALL_ENTRY, b"echo done\n"),
        ],
    );
    let root = dir.path().join("root");
    let extractor = TarGzExtractor::new();

    let files = extractor
        .extract(&archive, &root, false)
        .expect("must extract");
    let paths: Vec<&str> = files.iter().map(|entry| entry.path.as_str()).collect();
    assert_eq!(paths, vec!["/bin", "/bin/tool", "/bin/tool-link"]);
    assert_eq!(files[1].size, 5);
    assert_eq!(
        files[1].checksum,
        sha256_file(&root.join("bin/tool")).expect("must hash")
    );
    assert!(files[2].is_symlink());
    assert!(!root.join(".sitepack").exists());

    let listed = extractor.read_manifest(&archive).expect("must list");
    assert_eq!(listed, files);

    let script = extractor
        .post_install_script(&archive)
        .expect("must read script");
    assert_eq!(script.as_deref(), Some(&b"echo done\n"[..]));
}

#[test]
fn extract_refuses_existing_files_unless_overwriting() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let archive = dir.path().join("pkg.tar.gz");
    build_archive(
        &archive,
        &[Fixture::Dir("etc"), Fixture::File("etc/tool.conf", b"new\n")],
    );
    let root = dir.path().join("root");
    fs::create_dir_all(root.join("etc")).expect("must create etc");
    fs::write(root.join("etc/tool.conf"), b"old\n").expect("must write");
    let extractor = TarGzExtractor::new();

    let err = extractor
        .extract(&archive, &root, false)
        .expect_err("must refuse");
    assert!(err.to_string().contains("/etc/tool.conf"));
    assert_eq!(
        fs::read(root.join("etc/tool.conf")).expect("must read"),
        b"old\n"
    );

    extractor
        .extract(&archive, &root, true)
        .expect("must overwrite");
    assert_eq!(
        fs::read(root.join("etc/tool.conf")).expect("must read"),
        b"new\n"
    );
}

#[test]
fn entry_paths_cannot_escape_the_site_root() {
    assert!(entry_relative_path(Path::new("../etc/passwd")).is_err());
    assert!(entry_relative_path(Path::new("/etc/passwd")).is_err());
    assert!(entry_relative_path(Path::new("./")).expect("must accept").is_none());
    assert_eq!(
        entry_relative_path(Path::new("./bin/tool")).expect("must accept"),
        Some(PathBuf::from("bin/tool"))
    );
}

#[test]
fn extract_refuses_to_write_through_a_symlink_leaving_the_root() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let outside = dir.path().join("outside");
    fs::create_dir_all(&outside).expect("must create outside dir");
    let target = outside.to_string_lossy().to_string();
    let archive = dir.path().join("evil.tar.gz");
    build_archive(
        &archive,
        &[
            Fixture::Link("lib", &target),
            Fixture::File("lib/evil.txt", b"evil"),
        ],
    );
    let root = dir.path().join("root");

    let err = TarGzExtractor::new()
        .extract(&archive, &root, false)
        .expect_err("escaping write must fail");
    assert!(format!("{err:#}").contains("leaving the site root"));
    assert!(!outside.join("evil.txt").exists());
}

#[test]
fn extract_follows_symlinks_that_stay_inside_the_root() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let archive = dir.path().join("alias.tar.gz");
    build_archive(
        &archive,
        &[
            Fixture::Dir("real"),
            Fixture::Link("alias", "real"),
            Fixture::File("alias/ok.txt", b"ok"),
        ],
    );
    let root = dir.path().join("root");

    TarGzExtractor::new()
        .extract(&archive, &root, false)
        .expect("inner symlink must be usable");
    assert_eq!(
        fs::read(root.join("real/ok.txt")).expect("must read"),
        b"ok"
    );
}

#[test]
fn sanity_check_rejects_garbage() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let garbage = dir.path().join("garbage.tar.gz");
    fs::write(&garbage, b"not an archive at all").expect("must write");
    let valid = dir.path().join("valid.tar.gz");
    build_archive(&valid, &[Fixture::File("a.txt", b"a")]);

    let extractor = TarGzExtractor::new();
    assert!(!extractor.sanity_check(&garbage));
    assert!(extractor.sanity_check(&valid));
    assert!(!extractor.sanity_check(&dir.path().join("missing.tar.gz")));
}

#[test]
fn cached_archive_skips_the_fetcher() {
    let mut site = Site::new();
    let libfoo = site.publish_libfoo("2.1");
    let cache = site.root.join("mirror");
    fs::create_dir_all(cache.join("nested")).expect("must create cache");
    fs::copy(
        &libfoo.download_url,
        cache.join("nested").join(libfoo.file_name()),
    )
    .expect("must seed cache");

    let extractor = TarGzExtractor::new();
    let manager = DownloadManager::new(
        &site.fetcher,
        &extractor,
        site.root.join("downloads"),
        vec![cache.clone()],
        DEFAULT_WORKERS,
    );
    let report = manager.fetch(&[libfoo.clone()]).expect("must fetch");

    assert_eq!(site.fetcher.calls(), 0);
    let artifact = &report.artifacts[&libfoo.id];
    assert_eq!(artifact.source, ArtifactSource::Cache);
    assert!(artifact.path.starts_with(&cache));
}

#[test]
fn download_retries_once_then_gives_up() {
    let mut site = Site::new();
    let flaky = site.publish_libfoo("2.1");
    let broken = site.publish("libbar", "0.9", &[], &[Fixture::File("bar", b"bar")]);
    site.fetcher.fail(&flaky.download_url, 1);
    site.fetcher.fail(&broken.download_url, DOWNLOAD_ATTEMPTS);

    let extractor = TarGzExtractor::new();
    let downloads = site.root.join("downloads");
    let manager = DownloadManager::new(&site.fetcher, &extractor, &downloads, Vec::new(), 2);
    let report = manager
        .fetch(&[flaky.clone(), broken.clone(), flaky.clone()])
        .expect("must fetch");

    assert_eq!(site.fetcher.calls(), 4);
    assert_eq!(
        report.artifacts[&flaky.id].source,
        ArtifactSource::Downloaded
    );
    assert!(report.failures[&broken.id].contains("connection reset"));
    assert!(!report.is_complete());
    assert!(!downloads.join(format!("{}.tmp", broken.file_name())).exists());
    assert!(!downloads.join(broken.file_name()).exists());
}

#[test]
fn checksum_mismatch_fails_the_download() {
    let mut site = Site::new();
    let mut libfoo = site.publish_libfoo("2.1");
    libfoo.sha256 = Some("00".repeat(32));

    let extractor = TarGzExtractor::new();
    let downloads = site.root.join("downloads");
    let manager = DownloadManager::new(&site.fetcher, &extractor, &downloads, Vec::new(), 1);
    let report = manager.fetch(&[libfoo.clone()]).expect("must fetch");
    assert_eq!(site.fetcher.calls(), DOWNLOAD_ATTEMPTS);
    assert!(report.failures[&libfoo.id].contains("sha256 mismatch"));
    assert!(!downloads.join(format!("{}.tmp", libfoo.file_name())).exists());
    assert!(!downloads.join(libfoo.file_name()).exists());
}

#[test]
fn install_pulls_in_newest_matching_dependency_first() {
    let mut site = Site::new();
    site.publish_libfoo("1.0");
    site.publish_libfoo("2.1");
    site.publish_web_app();

    let report = site
        .installer()
        .install(&[requirement("web-app")], InstallOptions::default())
        .expect("must install");

    let order: Vec<String> = report
        .outcomes
        .iter()
        .map(|(id, _)| id.to_string())
        .collect();
    assert_eq!(order, vec!["libfoo-2.1-1", "web-app-1.4-1"]);
    assert!(report.is_complete());
    assert_eq!(report.summary(), "2 of 2 installed");
    assert_eq!(site.installed_ids(), vec!["libfoo-2.1-1", "web-app-1.4-1"]);
    assert!(site.root.join("bin/web-app").is_file());
    assert_eq!(
        fs::read_to_string(site.root.join("lib/libfoo.so")).expect("must read"),
        "libfoo 2.1\n"
    );
    assert!(fs::symlink_metadata(site.root.join("lib/libfoo.so.1"))
        .expect("must stat link")
        .file_type()
        .is_symlink());
}

#[test]
fn install_uses_installed_provider() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");
    site.publish_web_app();
    let installer = site.installer();
    installer
        .install(&[requirement("libfoo")], InstallOptions::default())
        .expect("must install libfoo");

    let report = installer
        .install(&[requirement("web-app")], InstallOptions::default())
        .expect("must install web-app");
    assert_eq!(report.committed().len(), 1);
    assert_eq!(
        report.outcomes[0].0,
        PackageId::new("web-app", "1.4", "1")
    );
}

#[test]
fn failed_download_skips_dependents_and_keeps_going() {
    let mut site = Site::new();
    let libbar = site.publish("libbar", "1.0", &[], &[Fixture::File("bar.txt", b"bar")]);
    site.publish("tool", "1.0", &["libbar"], &[Fixture::File("tool.txt", b"tool")]);
    site.publish("other", "1.0", &[], &[Fixture::File("other.txt", b"other")]);
    site.fetcher.fail(&libbar.download_url, DOWNLOAD_ATTEMPTS);

    let err = site
        .installer()
        .install(
            &[requirement("tool"), requirement("other")],
            InstallOptions::default(),
        )
        .expect_err("must be incomplete");
    let InstallError::Incomplete(report) = err else {
        panic!("unexpected error: {err}");
    };

    assert!(matches!(
        report.outcome(&PackageId::new("libbar", "1.0", "1")),
        Some(PackageOutcome::Failed { .. })
    ));
    assert!(matches!(
        report.outcome(&PackageId::new("tool", "1.0", "1")),
        Some(PackageOutcome::Skipped { .. })
    ));
    assert!(matches!(
        report.outcome(&PackageId::new("other", "1.0", "1")),
        Some(PackageOutcome::Committed { .. })
    ));
    assert_eq!(report.summary(), "1 of 3 installed");
    assert_eq!(site.installed_ids(), vec!["other-1.0-1"]);
}

#[test]
fn extraction_failure_aborts_the_rest_of_the_queue() {
    let mut site = Site::new();
    site.publish("first", "1.0", &[], &[Fixture::File("first.txt", b"1")]);
    site.publish("second", "1.0", &[], &[Fixture::File("second.txt", b"2")]);
    site.publish("third", "1.0", &[], &[Fixture::File("clash.txt", b"3")]);
    site.publish("fourth", "1.0", &[], &[Fixture::File("fourth.txt", b"4")]);
    site.publish("fifth", "1.0", &[], &[Fixture::File("fifth.txt", b"5")]);
    fs::write(site.root.join("clash.txt"), b"already here").expect("must write");

    let err = site
        .installer()
        .install(
            &[
                requirement("first"),
                requirement("second"),
                requirement("third"),
                requirement("fourth"),
                requirement("fifth"),
            ],
            InstallOptions::default(),
        )
        .expect_err("must be incomplete");
    let InstallError::Incomplete(report) = err else {
        panic!("unexpected error: {err}");
    };

    let order: Vec<String> = report
        .outcomes
        .iter()
        .map(|(id, _)| id.name.clone())
        .collect();
    assert_eq!(order, vec!["first", "second", "third", "fourth", "fifth"]);
    for name in ["first", "second"] {
        assert!(matches!(
            report.outcome(&PackageId::new(name, "1.0", "1")),
            Some(PackageOutcome::Committed { .. })
        ));
    }
    assert!(matches!(
        report.outcome(&PackageId::new("third", "1.0", "1")),
        Some(PackageOutcome::Failed { reason }) if reason.contains("already exist")
    ));
    for name in ["fourth", "fifth"] {
        assert!(matches!(
            report.outcome(&PackageId::new(name, "1.0", "1")),
            Some(PackageOutcome::Skipped { reason }) if reason.contains("third-1.0-1")
        ));
    }
    assert_eq!(report.summary(), "2 of 5 installed");
    assert_eq!(site.installed_ids(), vec!["first-1.0-1", "second-1.0-1"]);
    assert!(!site.root.join("fourth.txt").exists());
    assert_eq!(
        fs::read(site.root.join("clash.txt")).expect("must read"),
        b"already here"
    );
}

#[test]
fn install_replaces_an_older_installed_dependency() {
    let mut site = Site::new();
    site.publish_libfoo("1.5");
    site.installer()
        .install(&[requirement("libfoo")], InstallOptions::default())
        .expect("must install libfoo 1.5");
    assert_eq!(site.installed_ids(), vec!["libfoo-1.5-1"]);

    site.publish_libfoo("2.1");
    site.publish_web_app();
    let installer = site.installer();
    let report = installer
        .install(&[requirement("web-app")], InstallOptions::default())
        .expect("must install web-app over libfoo 1.5");

    let order: Vec<String> = report
        .outcomes
        .iter()
        .map(|(id, _)| id.to_string())
        .collect();
    assert_eq!(order, vec!["libfoo-2.1-1", "web-app-1.4-1"]);
    assert_eq!(report.summary(), "2 of 2 installed");
    assert_eq!(site.installed_ids(), vec!["libfoo-2.1-1", "web-app-1.4-1"]);
    assert_eq!(
        fs::read_to_string(site.root.join("lib/libfoo.so")).expect("must read"),
        "libfoo 2.1\n"
    );
    assert!(installer.check(&[]).expect("must check").is_empty());

    let staged = installer.layout().packages_cache_dir();
    assert!(!staged.join("libfoo-2.1-1.tar.gz").exists());
    assert!(!staged.join("web-app-1.4-1.tar.gz").exists());
}

#[test]
fn failed_replacement_download_keeps_the_installed_build() {
    let mut site = Site::new();
    site.publish_libfoo("1.5");
    site.installer()
        .install(&[requirement("libfoo")], InstallOptions::default())
        .expect("must install libfoo 1.5");

    let libfoo = site.publish_libfoo("2.1");
    site.publish_web_app();
    site.fetcher.fail(&libfoo.download_url, DOWNLOAD_ATTEMPTS);
    let err = site
        .installer()
        .install(&[requirement("web-app")], InstallOptions::default())
        .expect_err("must be incomplete");
    assert!(matches!(err, InstallError::Incomplete(_)));
    assert_eq!(site.installed_ids(), vec!["libfoo-1.5-1"]);
    assert_eq!(
        fs::read_to_string(site.root.join("lib/libfoo.so")).expect("must read"),
        "libfoo 1.5\n"
    );
}

/// Extracts normally, then truncates one file the way a short write would.
struct ShortWriteExtractor {
    inner: TarGzExtractor,
    truncated: &'static str,
}

impl Extractor for ShortWriteExtractor {
    fn extract(
        &self,
        archive: &Path,
        root: &Path,
        overwrite: bool,
    ) -> Result<Vec<sitepack_core::FileEntry>> {
        let files = self.inner.extract(archive, root, overwrite)?;
        File::options()
            .write(true)
            .open(root.join(self.truncated))?
            .set_len(1)?;
        Ok(files)
    }

    fn read_manifest(&self, archive: &Path) -> Result<Vec<sitepack_core::FileEntry>> {
        self.inner.read_manifest(archive)
    }

    fn post_install_script(&self, archive: &Path) -> Result<Option<Vec<u8>>> {
        self.inner.post_install_script(archive)
    }

    fn sanity_check(&self, archive: &Path) -> bool {
        self.inner.sanity_check(archive)
    }
}

#[test]
fn size_mismatch_after_extraction_fails_the_package() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");
    let installer = Installer::new(
        site.config(),
        Box::new(FakeRepository {
            packages: site.repository.clone(),
        }),
        Box::new(site.inventory()),
        Box::new(ShortWriteExtractor {
            inner: TarGzExtractor::new(),
            truncated: "share/libfoo.txt",
        }),
        Box::new(site.fetcher.clone()),
    );

    let err = installer
        .install(&[requirement("libfoo")], InstallOptions::default())
        .expect_err("must be incomplete");
    let InstallError::Incomplete(report) = err else {
        panic!("unexpected error: {err}");
    };
    let failed = report.failed();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].1.contains("/share/libfoo.txt"));
    assert!(failed[0].1.contains("expected 5, found 1"));
    assert!(site.installed_ids().is_empty());
}

#[test]
fn strict_install_reports_every_missing_dependency() {
    let mut site = Site::new();
    site.publish(
        "tool",
        "1.0",
        &["libmissing", "libgone >= 2"],
        &[Fixture::File("tool.txt", b"tool")],
    );

    let err = site
        .installer()
        .install(&[requirement("tool")], InstallOptions::default())
        .expect_err("must fail");
    let InstallError::Resolution(missing) = err else {
        panic!("unexpected error: {err}");
    };
    let names: Vec<&str> = missing
        .iter()
        .map(|entry| entry.dependency.name.as_str())
        .collect();
    assert_eq!(names, vec!["libmissing", "libgone"]);
    assert!(site.installed_ids().is_empty());

    let mut relaxed = site.config();
    relaxed.strict = false;
    site.installer_with(relaxed)
        .install(&[requirement("tool")], InstallOptions::default())
        .expect("non-strict install must proceed");
    assert_eq!(site.installed_ids(), vec!["tool-1.0-1"]);
}

#[test]
fn unknown_package_is_not_found() {
    let site = Site::new();
    let err = site
        .installer()
        .install(&[requirement("nope")], InstallOptions::default())
        .expect_err("must fail");
    assert!(matches!(err, InstallError::NotFound(name) if name == "nope"));
}

#[test]
fn dry_run_touches_nothing() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");
    site.publish_web_app();

    let report = site
        .installer()
        .install(
            &[requirement("web-app")],
            InstallOptions {
                dry_run: true,
                ..InstallOptions::default()
            },
        )
        .expect("dry run must succeed");
    assert_eq!(report.skipped().len(), 2);
    assert_eq!(site.fetcher.calls(), 0);
    assert!(site.installed_ids().is_empty());
    assert!(!site.root.join("bin").exists());
}

#[test]
fn download_only_stages_archives() {
    let mut site = Site::new();
    let libfoo = site.publish_libfoo("2.1");

    site.installer()
        .install(
            &[requirement("libfoo")],
            InstallOptions {
                download_only: true,
                ..InstallOptions::default()
            },
        )
        .expect("must stage");
    assert!(SiteLayout::new(&site.root)
        .packages_cache_dir()
        .join(libfoo.file_name())
        .is_file());
    assert!(site.installed_ids().is_empty());
}

#[test]
fn just_db_records_without_extracting() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");

    site.installer()
        .install(
            &[requirement("libfoo")],
            InstallOptions {
                just_db: true,
                ..InstallOptions::default()
            },
        )
        .expect("must record");
    let records = site
        .inventory()
        .get_installed(&InstalledFilter::named("libfoo"))
        .expect("must list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].files().len(), 5);
    assert!(!site.root.join("lib").exists());
}

#[test]
fn install_guards_point_at_the_right_command() {
    let mut site = Site::new();
    site.publish_libfoo("1.0");
    site.publish_libfoo("2.1");
    let installer = site.installer();
    installer
        .install(&[requirement("libfoo = 1.0")], InstallOptions::default())
        .expect("must install 1.0");

    let newer = installer
        .install(&[requirement("libfoo")], InstallOptions::default())
        .expect_err("must refuse");
    assert!(newer.to_string().contains("use update"));

    let same = installer
        .install(&[requirement("libfoo = 1.0")], InstallOptions::default())
        .expect_err("must refuse");
    assert!(same.to_string().contains("use reinstall"));

    installer
        .update(&[requirement("libfoo")], UpdateOptions::default())
        .expect("must update");
    let older = installer
        .install(&[requirement("libfoo = 1.0")], InstallOptions::default())
        .expect_err("must refuse");
    assert!(older.to_string().contains("downgrade"));
}

#[test]
fn update_replaces_the_installed_version() {
    let mut site = Site::new();
    site.publish_libfoo("1.0");
    site.publish_libfoo("2.1");
    let installer = site.installer();
    installer
        .install(&[requirement("libfoo = 1.0")], InstallOptions::default())
        .expect("must install 1.0");

    let report = installer
        .update(&[requirement("libfoo")], UpdateOptions::default())
        .expect("must update");
    assert!(report.is_complete());
    assert_eq!(site.installed_ids(), vec!["libfoo-2.1-1"]);
    assert_eq!(
        fs::read_to_string(site.root.join("lib/libfoo.so")).expect("must read"),
        "libfoo 2.1\n"
    );

    let same = installer
        .update(&[requirement("libfoo")], UpdateOptions::default())
        .expect_err("must refuse");
    assert!(same.to_string().contains("use reinstall"));

    let downgrade = installer
        .update(&[requirement("libfoo = 1.0")], UpdateOptions::default())
        .expect_err("must refuse");
    assert!(downgrade.to_string().contains("refusing to downgrade"));
}

#[test]
fn reinstall_restores_files_of_the_same_version() {
    let mut site = Site::new();
    site.publish_libfoo("1.0");
    let installer = site.installer();
    installer
        .install(&[requirement("libfoo")], InstallOptions::default())
        .expect("must install");
    fs::remove_file(site.root.join("share/libfoo.txt")).expect("must delete");
    assert_eq!(installer.check(&[]).expect("must check").len(), 1);

    installer
        .reinstall(&[requirement("libfoo")], UpdateOptions::default())
        .expect("must reinstall");
    assert!(installer.check(&[]).expect("must check").is_empty());
    assert_eq!(site.installed_ids(), vec!["libfoo-1.0-1"]);

    site.publish_libfoo("2.1");
    let mismatch = site
        .installer()
        .reinstall(&[requirement("libfoo")], UpdateOptions::default())
        .expect_err("must refuse");
    assert!(mismatch.to_string().contains("use update"));
}

#[test]
fn remove_is_blocked_by_installed_dependents() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");
    site.publish_web_app();
    let installer = site.installer();
    installer
        .install(&[requirement("web-app")], InstallOptions::default())
        .expect("must install");

    let err = installer
        .remove(&[requirement("libfoo")], RemoveOptions::default())
        .expect_err("must be blocked");
    let InstallError::BlockedByDependents {
        package,
        dependents,
    } = err
    else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(package, PackageId::new("libfoo", "2.1", "1"));
    assert_eq!(dependents, vec![PackageId::new("web-app", "1.4", "1")]);
    assert_eq!(site.installed_ids(), vec!["libfoo-2.1-1", "web-app-1.4-1"]);
    assert!(site.root.join("lib/libfoo.so").is_file());

    installer
        .remove(
            &[requirement("libfoo")],
            RemoveOptions {
                force: true,
                ..RemoveOptions::default()
            },
        )
        .expect("forced remove must succeed");
    assert_eq!(site.installed_ids(), vec!["web-app-1.4-1"]);
}

#[test]
fn remove_prunes_dependencies_nothing_else_needs() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");
    site.publish_web_app();
    let installer = site.installer();
    installer
        .install(&[requirement("web-app")], InstallOptions::default())
        .expect("must install");

    let report = installer
        .remove(&[requirement("web-app")], RemoveOptions::default())
        .expect("must remove");
    let order: Vec<String> = report
        .outcomes
        .iter()
        .map(|(id, _)| id.to_string())
        .collect();
    assert_eq!(order, vec!["web-app-1.4-1", "libfoo-2.1-1"]);
    assert!(site.installed_ids().is_empty());
    assert!(!site.root.join("lib").exists());
    assert!(!site.root.join("share").exists());
}

#[test]
fn remove_keeps_shared_directories_and_tolerates_missing_files() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");
    site.publish_web_app();
    let installer = site.installer();
    installer
        .install(&[requirement("web-app")], InstallOptions::default())
        .expect("must install");
    fs::remove_file(site.root.join("bin/web-app")).expect("must delete");

    installer
        .remove(
            &[requirement("web-app")],
            RemoveOptions {
                nodeps: true,
                ..RemoveOptions::default()
            },
        )
        .expect("must remove");

    assert_eq!(site.installed_ids(), vec!["libfoo-2.1-1"]);
    assert!(!site.root.join("bin").exists());
    assert!(!site.root.join("share/web-app.txt").exists());
    assert!(site.root.join("share/libfoo.txt").is_file());
}

#[test]
fn remove_of_unknown_package_is_not_found() {
    let site = Site::new();
    let err = site
        .installer()
        .remove(&[requirement("libfoo")], RemoveOptions::default())
        .expect_err("must fail");
    assert!(matches!(err, InstallError::NotFound(_)));
}

#[test]
fn post_install_runs_with_site_environment() {
    let mut site = Site::new();
    site.publish(
        "hooked",
        "1.0",
        &[],
        &[
            Fixture::File("hooked.txt", b"x"),
            Fixture::File(
                POST_INSTALL_ENTRY,
                b"printf '%s|%s' \"$MYSITEROOT\" \"$RPM_INSTALL_PREFIX\" > \"$MYSITEROOT/marker\"\n",
            ),
        ],
    );
    let mut failing = site.publish("failing", "1.0", &[], &[Fixture::File("failing.txt", b"y")]);
    failing.post_install_script = Some(b"exit 3\n".to_vec());
    site.repository.retain(|package| package.name() != "failing");
    site.repository.push(failing);

    let report = site
        .installer()
        .install(
            &[requirement("hooked"), requirement("failing")],
            InstallOptions::default(),
        )
        .expect("post-install failures are not fatal");

    let root = site.root.to_string_lossy().to_string();
    assert_eq!(
        fs::read_to_string(site.root.join("marker")).expect("must read marker"),
        format!("{root}|{root}")
    );
    assert_eq!(
        report.outcome(&PackageId::new("hooked", "1.0", "1")),
        Some(&PackageOutcome::Committed {
            post_install: PostInstallStatus::Success
        })
    );
    assert_eq!(
        report.outcome(&PackageId::new("failing", "1.0", "1")),
        Some(&PackageOutcome::Committed {
            post_install: PostInstallStatus::Error
        })
    );

    let statuses: Vec<PostInstallStatus> = site
        .inventory()
        .installed_records()
        .expect("must list")
        .iter()
        .map(|record| record.post_install)
        .collect();
    assert_eq!(
        statuses,
        vec![PostInstallStatus::Error, PostInstallStatus::Success]
    );
}

#[test]
fn check_reports_size_checksum_and_missing_problems() {
    let mut site = Site::new();
    site.publish(
        "tool",
        "1.0",
        &[],
        &[
            Fixture::Dir("etc"),
            Fixture::File("etc/a.conf", b"aaaa"),
            Fixture::File("etc/b.conf", b"bbbb"),
            Fixture::File("etc/c.conf", b"cccc"),
            Fixture::Link("etc/d.conf", "a.conf"),
        ],
    );
    let installer = site.installer();
    installer
        .install(&[requirement("tool")], InstallOptions::default())
        .expect("must install");
    assert!(installer.check(&[]).expect("must check").is_empty());

    fs::write(site.root.join("etc/a.conf"), b"AAAA").expect("must write");
    fs::write(site.root.join("etc/b.conf"), b"b").expect("must write");
    fs::remove_file(site.root.join("etc/c.conf")).expect("must delete");
    fs::remove_file(site.root.join("etc/d.conf")).expect("must delete");

    let problems = installer
        .check(&[requirement("tool")])
        .expect("must check");
    let found: Vec<(String, FileProblem)> = problems
        .into_iter()
        .map(|problem| (problem.path, problem.problem))
        .collect();
    assert_eq!(
        found,
        vec![
            ("/etc/a.conf".to_string(), FileProblem::ChecksumMismatch),
            (
                "/etc/b.conf".to_string(),
                FileProblem::SizeMismatch {
                    expected: 4,
                    actual: 1
                }
            ),
            ("/etc/c.conf".to_string(), FileProblem::MissingFile),
            ("/etc/d.conf".to_string(), FileProblem::MissingLink),
        ]
    );
}

#[test]
fn dependency_queries_work_without_installing() {
    let mut site = Site::new();
    site.publish_libfoo("2.1");
    site.publish_web_app();
    site.publish("broken", "1.0", &["libmissing"], &[Fixture::File("b", b"b")]);
    let installer = site.installer();

    let deps: Vec<String> = installer
        .list_dependencies(&requirement("web-app"))
        .expect("must list")
        .iter()
        .map(|package| package.id.to_string())
        .collect();
    assert_eq!(deps, vec!["libfoo-2.1-1"]);

    let dot_path = installer
        .dependency_graph_dot(
            &[requirement("web-app"), requirement("broken")],
            false,
            Some(Path::new("deps")),
        )
        .expect("must write graph");
    assert_eq!(
        dot_path,
        SiteLayout::new(&site.root).graphs_dir().join("deps.dot")
    );
    let dot = fs::read_to_string(&dot_path).expect("must read graph");
    assert!(dot.contains("\"web-app-1.4-1\" -> \"libfoo-2.1-1\";"));
    assert!(dot.contains("libmissing"));

    let providers = installer.list_provides("web").expect("must search");
    assert_eq!(providers.len(), 1);
    assert!(site.installed_ids().is_empty());
}

#[test]
fn config_defaults_and_overrides() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let defaults = InstallerConfig::load(dir.path()).expect("must load defaults");
    assert_eq!(defaults.workers, DEFAULT_WORKERS);
    assert!(defaults.strict);
    assert!(defaults
        .ignored_packages
        .iter()
        .any(|name| name == "/bin/sh"));

    let layout = SiteLayout::new(dir.path());
    fs::create_dir_all(layout.etc_dir()).expect("must create etc");
    fs::write(
        layout.config_path(),
        "registry = \"registry\"\ncache_dirs = [\"/srv/cache\"]\nworkers = 2\nstrict = false\n",
    )
    .expect("must write config");
    let config = InstallerConfig::load(dir.path()).expect("must load config");
    assert_eq!(config.registry_path(), Some(dir.path().join("registry")));
    assert_eq!(config.cache_paths(), vec![PathBuf::from("/srv/cache")]);
    assert_eq!(config.workers, 2);
    assert!(!config.strict);

    fs::write(layout.config_path(), "registery = \"typo\"\n").expect("must write config");
    assert!(InstallerConfig::load(dir.path()).is_err());
}

#[test]
fn open_requires_a_registry() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let err = match Installer::open(InstallerConfig::for_root(dir.path())) {
        Ok(_) => panic!("open without registry must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, InstallError::Usage(_)));
}

#[test]
fn registry_backed_install_end_to_end() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let registry = dir.path().join("registry");
    fs::create_dir_all(registry.join("index/libfoo")).expect("must create index");
    fs::create_dir_all(registry.join("packages")).expect("must create packages");
    let archive = registry.join("packages/libfoo-2.1-1.tar.gz");
    build_archive(
        &archive,
        &[Fixture::Dir("lib"), Fixture::File("lib/libfoo.so", b"foo")],
    );
    let digest = sha256_file(&archive).expect("must hash");
    fs::write(
        registry.join("index/libfoo/2.1-1.toml"),
        format!(
            "name = \"libfoo\"\nversion = \"2.1\"\nrelease = \"1\"\nurl = \"packages/libfoo-2.1-1.tar.gz\"\nsha256 = \"{digest}\"\n"
        ),
    )
    .expect("must write manifest");

    let root = dir.path().join("site");
    let mut config = InstallerConfig::for_root(&root);
    config.registry = Some(registry);
    let installer = Installer::open(config).expect("must open");
    installer
        .install(&[requirement("libfoo")], InstallOptions::default())
        .expect("must install");

    assert_eq!(fs::read(root.join("lib/libfoo.so")).expect("must read"), b"foo");
    let records = installer
        .list_installed(&InstalledFilter::all())
        .expect("must list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].package.sha256.as_deref(), Some(digest.as_str()));
}
