use anyhow::{bail, Context, Result};
use sitepack_core::{InstalledRecord, LocalInventory, PackageId, PackageRef, PostInstallStatus};
use sitepack_resolver::DependencyGraph;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::check::check_file_sizes;
use crate::download::DownloadReport;
use crate::extract::Extractor;
use crate::fs_utils::{remove_dir_if_empty, remove_file_if_exists};
use crate::layout::SiteLayout;
use crate::postinstall::run_post_install;

/// Packages to install, dependencies first, with each package's direct
/// dependencies inside the plan.
#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    pub packages: Vec<PackageRef>,
    pub dependencies: BTreeMap<PackageId, Vec<PackageId>>,
}

impl InstallPlan {
    pub fn from_graph(graph: &DependencyGraph) -> Self {
        let packages = graph.package_order();
        let dependencies = packages
            .iter()
            .map(|package| {
                let deps = graph
                    .dependencies_of(&package.id)
                    .into_iter()
                    .map(|dep| dep.id)
                    .collect();
                (package.id.clone(), deps)
            })
            .collect();
        Self {
            packages,
            dependencies,
        }
    }

    /// A plan without dependency edges, deduplicated by id.
    pub fn flat(packages: Vec<PackageRef>) -> Self {
        let mut seen = HashSet::new();
        let packages = packages
            .into_iter()
            .filter(|package| seen.insert(package.id.clone()))
            .collect();
        Self {
            packages,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn ids(&self) -> Vec<PackageId> {
        self.packages.iter().map(|package| package.id.clone()).collect()
    }

    fn dependencies_of(&self, id: &PackageId) -> &[PackageId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub just_db: bool,
    pub overwrite: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOutcome {
    Committed { post_install: PostInstallStatus },
    Removed,
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionKind {
    #[default]
    Install,
    Remove,
}

impl TransactionKind {
    fn past_tense(self) -> &'static str {
        match self {
            Self::Install => "installed",
            Self::Remove => "removed",
        }
    }
}

/// Per-package outcomes in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionReport {
    pub kind: TransactionKind,
    pub outcomes: Vec<(PackageId, PackageOutcome)>,
}

impl TransactionReport {
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            kind,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, id: &PackageId, outcome: PackageOutcome) {
        self.outcomes.push((id.clone(), outcome));
    }

    pub fn outcome(&self, id: &PackageId) -> Option<&PackageOutcome> {
        self.outcomes
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, outcome)| outcome)
    }

    pub fn committed(&self) -> Vec<&PackageId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| {
                matches!(
                    outcome,
                    PackageOutcome::Committed { .. } | PackageOutcome::Removed
                )
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn failed(&self) -> Vec<(&PackageId, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                PackageOutcome::Failed { reason } => Some((id, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<(&PackageId, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                PackageOutcome::Skipped { reason } => Some((id, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.committed().len() == self.outcomes.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} of {} {}",
            self.committed().len(),
            self.outcomes.len(),
            self.kind.past_tense()
        )
    }
}

impl fmt::Display for TransactionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())?;
        for (id, reason) in self.failed() {
            write!(f, "; {id} failed: {reason}")?;
        }
        let skipped = self.skipped();
        if !skipped.is_empty() {
            let names: Vec<String> = skipped.iter().map(|(id, _)| id.to_string()).collect();
            write!(f, "; skipped: {}", names.join(", "))?;
        }
        Ok(())
    }
}

/// Applies install and remove plans to the site root and the inventory.
pub struct TransactionEngine<'a> {
    layout: &'a SiteLayout,
    inventory: &'a dyn LocalInventory,
    extractor: &'a dyn Extractor,
}

impl<'a> TransactionEngine<'a> {
    pub fn new(
        layout: &'a SiteLayout,
        inventory: &'a dyn LocalInventory,
        extractor: &'a dyn Extractor,
    ) -> Self {
        Self {
            layout,
            inventory,
            extractor,
        }
    }

    pub fn install(
        &self,
        plan: &InstallPlan,
        downloads: &DownloadReport,
        options: EngineOptions,
    ) -> TransactionReport {
        let mut report = TransactionReport::new(TransactionKind::Install);

        if options.dry_run {
            for (position, package) in plan.packages.iter().enumerate() {
                info!(position = position + 1, package = %package.id, "would install");
                report.record(
                    &package.id,
                    PackageOutcome::Skipped {
                        reason: "dry run".to_string(),
                    },
                );
            }
            return report;
        }

        let mut blocked: HashSet<PackageId> = HashSet::new();
        let mut aborted_by: Option<PackageId> = None;

        for package in &plan.packages {
            let id = &package.id;
            if let Some(cause) = &aborted_by {
                report.record(
                    id,
                    PackageOutcome::Skipped {
                        reason: format!("transaction aborted after {cause} failed"),
                    },
                );
                continue;
            }

            if let Some(reason) = downloads.failures.get(id) {
                blocked.insert(id.clone());
                report.record(
                    id,
                    PackageOutcome::Failed {
                        reason: format!("download failed: {reason}"),
                    },
                );
                continue;
            }

            if let Some(dependency) = plan
                .dependencies_of(id)
                .iter()
                .find(|dependency| blocked.contains(*dependency))
            {
                warn!(package = %id, dependency = %dependency, "skipping, dependency not installed");
                report.record(
                    id,
                    PackageOutcome::Skipped {
                        reason: format!("dependency {dependency} was not installed"),
                    },
                );
                blocked.insert(id.clone());
                continue;
            }

            let Some(artifact) = downloads.artifacts.get(id) else {
                blocked.insert(id.clone());
                report.record(
                    id,
                    PackageOutcome::Failed {
                        reason: "no downloaded archive".to_string(),
                    },
                );
                continue;
            };

            match self.install_one(package, &artifact.path, options) {
                Ok(post_install) => {
                    info!(package = %id, post_install = post_install.as_str(), "installed");
                    report.record(id, PackageOutcome::Committed { post_install });
                }
                Err(err) => {
                    error!(package = %id, error = %format!("{err:#}"), "install failed");
                    report.record(
                        id,
                        PackageOutcome::Failed {
                            reason: format!("{err:#}"),
                        },
                    );
                    aborted_by = Some(id.clone());
                }
            }
        }

        report
    }

    fn install_one(
        &self,
        package: &PackageRef,
        archive: &Path,
        options: EngineOptions,
    ) -> Result<PostInstallStatus> {
        let files = if options.just_db {
            self.extractor.read_manifest(archive)?
        } else {
            debug!(package = %package.id, archive = %archive.display(), "extracting");
            self.extractor
                .extract(archive, self.layout.root(), options.overwrite)?
        };

        let record = self.inventory.add_record(package, files)?;

        if !options.just_db {
            if let Err(err) = self.verify_sizes(&record) {
                if let Err(cleanup) = self.inventory.remove_record(record.id()) {
                    warn!(
                        package = %record.id(),
                        error = %format!("{cleanup:#}"),
                        "failed to drop record of failed install"
                    );
                }
                return Err(err);
            }
        }

        if options.just_db {
            return Ok(PostInstallStatus::NotRun);
        }

        let script = match self.extractor.post_install_script(archive) {
            Ok(Some(script)) => Some(script),
            Ok(None) => package.post_install_script.clone(),
            Err(err) => {
                warn!(
                    package = %package.id,
                    error = %format!("{err:#}"),
                    "could not read post-install script from archive"
                );
                package.post_install_script.clone()
            }
        };
        let Some(script) = script else {
            return Ok(PostInstallStatus::NotRun);
        };

        let status = run_post_install(self.layout, &package.id, &script);
        if let Err(err) = self.inventory.set_post_install_status(&package.id, status) {
            warn!(
                package = %package.id,
                error = %format!("{err:#}"),
                "failed to record post-install status"
            );
        }
        Ok(status)
    }

    fn verify_sizes(&self, record: &InstalledRecord) -> Result<()> {
        let problems = check_file_sizes(self.layout, record.id(), record.files())?;
        if let Some(first) = problems.first() {
            bail!(
                "{} file(s) not installed correctly, first: {}: {}",
                problems.len(),
                first.path,
                first.problem
            );
        }
        Ok(())
    }

    /// Removes each record's files and then the record, in the given order.
    pub fn remove(&self, records: &[InstalledRecord], options: EngineOptions) -> TransactionReport {
        let mut report = TransactionReport::new(TransactionKind::Remove);
        let mut aborted_by: Option<PackageId> = None;

        for record in records {
            let id = record.id();
            if options.dry_run {
                info!(package = %id, "would remove");
                report.record(
                    id,
                    PackageOutcome::Skipped {
                        reason: "dry run".to_string(),
                    },
                );
                continue;
            }
            if let Some(cause) = &aborted_by {
                report.record(
                    id,
                    PackageOutcome::Skipped {
                        reason: format!("transaction aborted after {cause} failed"),
                    },
                );
                continue;
            }

            let outcome = if options.just_db {
                Ok(())
            } else {
                self.remove_files(record)
            }
            .and_then(|()| self.inventory.remove_record(id));

            match outcome {
                Ok(()) => {
                    info!(package = %id, "removed");
                    report.record(id, PackageOutcome::Removed);
                }
                Err(err) => {
                    error!(package = %id, error = %format!("{err:#}"), "remove failed");
                    report.record(
                        id,
                        PackageOutcome::Failed {
                            reason: format!("{err:#}"),
                        },
                    );
                    aborted_by = Some(id.clone());
                }
            }
        }

        report
    }

    fn remove_files(&self, record: &InstalledRecord) -> Result<()> {
        let (dirs, others): (Vec<_>, Vec<_>) =
            record.files().iter().rev().partition(|entry| entry.is_dir);

        for entry in others.into_iter().chain(dirs) {
            let path = self.layout.entry_path(entry);
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "already gone");
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to stat {}", path.display()))
                }
            };

            if metadata.is_dir() {
                if !remove_dir_if_empty(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?
                {
                    debug!(path = %path.display(), "keeping non-empty directory");
                }
            } else {
                remove_file_if_exists(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}

/// Report for a download-only run: staged packages are skipped, failed
/// downloads are failures.
pub fn staged_report(plan: &InstallPlan, downloads: &DownloadReport) -> TransactionReport {
    let mut report = TransactionReport::new(TransactionKind::Install);
    for package in &plan.packages {
        let outcome = match downloads.failures.get(&package.id) {
            Some(reason) => PackageOutcome::Failed {
                reason: format!("download failed: {reason}"),
            },
            None => PackageOutcome::Skipped {
                reason: "download only".to_string(),
            },
        };
        report.record(&package.id, outcome);
    }
    report
}
