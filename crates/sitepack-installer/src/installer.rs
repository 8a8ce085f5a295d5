use anyhow::Context;
use sitepack_core::{
    FileEntry, InstalledFilter, InstalledRecord, LocalInventory, PackageId, PackageRef,
    PostInstallStatus, RepositoryClient, Requirement,
};
use sitepack_registry::RegistryIndex;
use sitepack_resolver::{DependencyGraph, ResolveOptions, Resolver};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::check::{check_record, CheckProblem};
use crate::config::InstallerConfig;
use crate::download::{ArtifactSource, DownloadManager, DownloadReport, Fetcher, HttpFetcher};
use crate::error::{InstallError, InstallResult};
use crate::extract::{Extractor, TarGzExtractor};
use crate::fs_utils::remove_file_if_exists;
use crate::inventory::ReceiptInventory;
use crate::layout::SiteLayout;
use crate::transaction::{
    staged_report, EngineOptions, InstallPlan, TransactionEngine, TransactionKind,
    TransactionReport,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub just_db: bool,
    pub overwrite: bool,
    pub dry_run: bool,
    pub nodeps: bool,
    pub download_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub just_db: bool,
    pub force: bool,
    pub nodeps: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub just_db: bool,
    pub dry_run: bool,
    pub nodeps: bool,
}

/// Inventory that hides installed packages with the given names, so the
/// resolver plans around versions about to be replaced.
struct InventoryView<'a> {
    inner: &'a dyn LocalInventory,
    hidden: HashSet<String>,
}

impl LocalInventory for InventoryView<'_> {
    fn installed_records(&self) -> anyhow::Result<Vec<InstalledRecord>> {
        Ok(self
            .inner
            .installed_records()?
            .into_iter()
            .filter(|record| !self.hidden.contains(record.package.name()))
            .collect())
    }

    fn add_record(
        &self,
        package: &PackageRef,
        files: Vec<FileEntry>,
    ) -> anyhow::Result<InstalledRecord> {
        self.inner.add_record(package, files)
    }

    fn remove_record(&self, id: &PackageId) -> anyhow::Result<()> {
        self.inner.remove_record(id)
    }

    fn set_post_install_status(
        &self,
        id: &PackageId,
        status: PostInstallStatus,
    ) -> anyhow::Result<()> {
        self.inner.set_post_install_status(id, status)
    }
}

/// Entry point tying the repository, the inventory and the transaction
/// engine together for one site root.
pub struct Installer {
    layout: SiteLayout,
    config: InstallerConfig,
    repository: Box<dyn RepositoryClient>,
    inventory: Box<dyn LocalInventory>,
    extractor: Box<dyn Extractor>,
    fetcher: Box<dyn Fetcher>,
}

impl Installer {
    pub fn new(
        config: InstallerConfig,
        repository: Box<dyn RepositoryClient>,
        inventory: Box<dyn LocalInventory>,
        extractor: Box<dyn Extractor>,
        fetcher: Box<dyn Fetcher>,
    ) -> Self {
        Self {
            layout: config.layout(),
            config,
            repository,
            inventory,
            extractor,
            fetcher,
        }
    }

    /// Wires the registry index, receipt inventory, tar extractor and HTTP
    /// fetcher for `config.root`.
    pub fn open(config: InstallerConfig) -> InstallResult<Self> {
        let Some(registry) = config.registry_path() else {
            return Err(InstallError::Usage(
                "no registry configured, pass --registry or set `registry` in etc/sitepack.toml"
                    .to_string(),
            ));
        };
        let layout = config.layout();
        layout.ensure_base_dirs()?;
        debug!(root = %layout.root().display(), registry = %registry.display(), "opening site");

        Ok(Self::new(
            config,
            Box::new(RegistryIndex::open(registry)),
            Box::new(ReceiptInventory::new(layout)),
            Box::new(TarGzExtractor::new()),
            Box::new(HttpFetcher::new()?),
        ))
    }

    pub fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    fn resolver<'s>(&'s self, inventory: &'s dyn LocalInventory) -> Resolver<'s> {
        Resolver::new(
            self.repository.as_ref(),
            inventory,
            self.config.ignored_packages.clone(),
        )
    }

    fn engine(&self) -> TransactionEngine<'_> {
        TransactionEngine::new(&self.layout, self.inventory.as_ref(), self.extractor.as_ref())
    }

    fn lookup(&self, requests: &[Requirement]) -> InstallResult<Vec<PackageRef>> {
        let mut packages: Vec<PackageRef> = Vec::new();
        for request in requests {
            let package = self
                .repository
                .find_latest_matching(request)
                .with_context(|| format!("failed to look up '{request}'"))?
                .ok_or_else(|| InstallError::NotFound(request.to_string()))?;
            if !packages.iter().any(|known| known.id == package.id) {
                packages.push(package);
            }
        }
        Ok(packages)
    }

    fn installed_matching(&self, request: &Requirement) -> InstallResult<Vec<InstalledRecord>> {
        let records: Vec<InstalledRecord> = self
            .inventory
            .get_installed(&InstalledFilter::named(request.name.as_str()))?
            .into_iter()
            .filter(|record| {
                request.matches_version(&record.package.id.version, &record.package.id.release)
            })
            .collect();
        if records.is_empty() {
            return Err(InstallError::NotFound(format!("{request} (installed)")));
        }
        Ok(records)
    }

    fn resolve_plan(
        &self,
        requested: &[PackageRef],
        inventory: &dyn LocalInventory,
        nodeps_update: bool,
    ) -> InstallResult<InstallPlan> {
        let resolution = self.resolver(inventory).resolve(
            requested,
            ResolveOptions {
                ignore_installed: false,
                nodeps_update,
                strict: self.config.strict,
            },
        )?;
        if self.config.strict && !resolution.is_complete() {
            return Err(InstallError::Resolution(resolution.missing));
        }
        Ok(InstallPlan::from_graph(&resolution.graph))
    }

    fn download(&self, packages: &[PackageRef]) -> InstallResult<DownloadReport> {
        let manager = DownloadManager::new(
            self.fetcher.as_ref(),
            self.extractor.as_ref(),
            self.layout.packages_cache_dir(),
            self.config.cache_paths(),
            self.config.workers,
        );
        Ok(manager.fetch(packages)?)
    }

    /// Installed builds older than a package of the same name in `plan`.
    fn superseded_records(&self, plan: &InstallPlan) -> InstallResult<Vec<InstalledRecord>> {
        let mut replacing = Vec::new();
        for package in &plan.packages {
            for record in self
                .inventory
                .get_installed(&InstalledFilter::named(package.name()))?
            {
                if record.id().cmp_evr(&package.id).is_lt() {
                    info!(from = %record.id(), to = %package.id, "replacing");
                    replacing.push(record);
                }
            }
        }
        Ok(replacing)
    }

    /// Downloads `plan`, removes `replacing` for every package that was
    /// staged, then installs.
    fn run_plan(
        &self,
        plan: InstallPlan,
        replacing: Vec<InstalledRecord>,
        options: EngineOptions,
        download_only: bool,
    ) -> InstallResult<TransactionReport> {
        let engine = self.engine();
        if plan.is_empty() {
            info!("nothing to install");
            return Ok(TransactionReport::new(TransactionKind::Install));
        }

        if options.dry_run {
            for record in &replacing {
                info!(package = %record.id(), "would replace");
            }
            return Ok(engine.install(&plan, &DownloadReport::default(), options));
        }

        let downloads = self.download(&plan.packages)?;
        if download_only {
            let report = staged_report(&plan, &downloads);
            info!(
                staged = downloads.artifacts.len(),
                dir = %self.layout.packages_cache_dir().display(),
                "download only"
            );
            return if downloads.is_complete() {
                Ok(report)
            } else {
                Err(InstallError::Incomplete(report))
            };
        }

        let replacing: Vec<InstalledRecord> = replacing
            .into_iter()
            .filter(|record| {
                plan.packages.iter().any(|package| {
                    package.name() == record.package.name()
                        && downloads.artifacts.contains_key(&package.id)
                })
            })
            .collect();
        if !replacing.is_empty() {
            let removal = engine.remove(
                &replacing,
                EngineOptions {
                    just_db: options.just_db,
                    ..EngineOptions::default()
                },
            );
            if !removal.is_complete() {
                return Err(InstallError::Incomplete(removal));
            }
        }

        let report = engine.install(&plan, &downloads, options);
        info!(summary = %report.summary(), "install finished");
        discard_fetched_archives(&report, &downloads);
        if report.is_complete() {
            Ok(report)
        } else {
            Err(InstallError::Incomplete(report))
        }
    }

    pub fn install(
        &self,
        requests: &[Requirement],
        options: InstallOptions,
    ) -> InstallResult<TransactionReport> {
        let requested = self.lookup(requests)?;
        for package in &requested {
            self.guard_install(package)?;
        }

        let plan = if options.nodeps {
            InstallPlan::flat(requested)
        } else {
            self.resolve_plan(&requested, self.inventory.as_ref(), false)?
        };
        info!(packages = plan.len(), "install plan ready");
        let replacing = self.superseded_records(&plan)?;

        self.run_plan(
            plan,
            replacing,
            EngineOptions {
                just_db: options.just_db,
                overwrite: options.overwrite,
                dry_run: options.dry_run,
            },
            options.download_only,
        )
    }

    fn guard_install(&self, package: &PackageRef) -> InstallResult<()> {
        let installed = self
            .inventory
            .get_installed(&InstalledFilter::named(package.name()))?;
        if let Some(record) = installed.into_iter().next() {
            let message = match package.id.cmp_evr(record.id()) {
                std::cmp::Ordering::Greater => format!(
                    "{} is installed and {} is available, use update",
                    record.id(),
                    package.id
                ),
                std::cmp::Ordering::Less => format!(
                    "{} is newer than {}, that would be a downgrade, remove it first",
                    record.id(),
                    package.id
                ),
                std::cmp::Ordering::Equal => {
                    format!("{} is already installed, use reinstall", record.id())
                }
            };
            return Err(InstallError::Usage(message));
        }
        Ok(())
    }

    pub fn remove(
        &self,
        requests: &[Requirement],
        options: RemoveOptions,
    ) -> InstallResult<TransactionReport> {
        let mut removal: Vec<InstalledRecord> = Vec::new();
        for request in requests {
            for record in self.installed_matching(request)? {
                if !removal.iter().any(|known| known.id() == record.id()) {
                    removal.push(record);
                }
            }
        }

        let installed = self.inventory.installed_records()?;
        if !options.force {
            let removing: HashSet<PackageId> =
                removal.iter().map(|record| record.id().clone()).collect();
            for record in &removal {
                let dependents = self.blocking_dependents(record, &removing, &installed)?;
                if !dependents.is_empty() {
                    return Err(InstallError::BlockedByDependents {
                        package: record.id().clone(),
                        dependents,
                    });
                }
            }
        }

        if !options.nodeps {
            prune_unused_dependencies(&mut removal, &installed);
        }

        let ordered = removal_order(removal);
        info!(packages = ordered.len(), "remove plan ready");
        let report = self.engine().remove(
            &ordered,
            EngineOptions {
                just_db: options.just_db,
                overwrite: false,
                dry_run: options.dry_run,
            },
        );
        if report.is_complete() || options.dry_run {
            Ok(report)
        } else {
            Err(InstallError::Incomplete(report))
        }
    }

    /// Installed packages outside `removing` that need `record` and have no
    /// other installed provider.
    fn blocking_dependents(
        &self,
        record: &InstalledRecord,
        removing: &HashSet<PackageId>,
        installed: &[InstalledRecord],
    ) -> InstallResult<Vec<PackageId>> {
        let dependents = self.inventory.find_dependents(record.id())?;
        Ok(dependents
            .into_iter()
            .filter(|dependent| !removing.contains(dependent.id()))
            .filter(|dependent| {
                dependent.package.requires.iter().any(|requirement| {
                    record.package.fulfills(requirement)
                        && !installed.iter().any(|other| {
                            !removing.contains(other.id())
                                && other.id() != dependent.id()
                                && other.package.fulfills(requirement)
                        })
                })
            })
            .map(|dependent| dependent.package.id)
            .collect())
    }

    pub fn update(
        &self,
        requests: &[Requirement],
        options: UpdateOptions,
    ) -> InstallResult<TransactionReport> {
        let requested = self.lookup(requests)?;
        for package in &requested {
            let installed = self
                .inventory
                .get_installed(&InstalledFilter::named(package.name()))?;
            for record in installed {
                match package.id.cmp_evr(record.id()) {
                    std::cmp::Ordering::Less => {
                        return Err(InstallError::Usage(format!(
                            "{} is older than installed {}, refusing to downgrade",
                            package.id,
                            record.id()
                        )))
                    }
                    std::cmp::Ordering::Equal => {
                        return Err(InstallError::Usage(format!(
                            "{} is already the latest version, use reinstall",
                            record.id()
                        )))
                    }
                    std::cmp::Ordering::Greater => {}
                }
            }
        }

        let view = InventoryView {
            inner: self.inventory.as_ref(),
            hidden: requested
                .iter()
                .map(|package| package.name().to_string())
                .collect(),
        };
        let plan = self.resolve_plan(&requested, &view, !options.nodeps)?;
        let replacing = self.superseded_records(&plan)?;

        self.run_plan(
            plan,
            replacing,
            EngineOptions {
                just_db: options.just_db,
                overwrite: false,
                dry_run: options.dry_run,
            },
            false,
        )
    }

    pub fn reinstall(
        &self,
        requests: &[Requirement],
        options: UpdateOptions,
    ) -> InstallResult<TransactionReport> {
        let requested = self.lookup(requests)?;
        let mut replacing = Vec::new();
        for package in &requested {
            let installed = self
                .inventory
                .get_installed(&InstalledFilter::named(package.name()))?;
            if installed.is_empty() {
                return Err(InstallError::Usage(format!(
                    "{} is not installed, use install",
                    package.name()
                )));
            }
            let Some(record) = installed.into_iter().find(|record| record.id() == &package.id)
            else {
                return Err(InstallError::Usage(format!(
                    "installed version of {} does not match {}, use update",
                    package.name(),
                    package.id
                )));
            };
            replacing.push(record);
        }

        self.run_plan(
            InstallPlan::flat(requested),
            replacing,
            EngineOptions {
                just_db: options.just_db,
                overwrite: true,
                dry_run: options.dry_run,
            },
            false,
        )
    }

    /// Verifies installed files; every installed package when `requests`
    /// is empty.
    pub fn check(&self, requests: &[Requirement]) -> InstallResult<Vec<CheckProblem>> {
        let records = if requests.is_empty() {
            self.inventory.installed_records()?
        } else {
            let mut records = Vec::new();
            for request in requests {
                records.extend(self.installed_matching(request)?);
            }
            records
        };

        let mut problems = Vec::new();
        for record in &records {
            let found = check_record(&self.layout, record)?;
            debug!(package = %record.id(), problems = found.len(), "checked");
            problems.extend(found);
        }
        Ok(problems)
    }

    pub fn list_installed(&self, filter: &InstalledFilter) -> InstallResult<Vec<InstalledRecord>> {
        Ok(self.inventory.get_installed(filter)?)
    }

    pub fn list_dependencies(&self, request: &Requirement) -> InstallResult<Vec<PackageRef>> {
        let package = self
            .lookup(std::slice::from_ref(request))?
            .into_iter()
            .next()
            .ok_or_else(|| InstallError::NotFound(request.to_string()))?;
        Ok(self
            .resolver(self.inventory.as_ref())
            .dependencies(&package)?)
    }

    /// Writes the dependency graph of `requests` to the graphs directory,
    /// unresolved requirements included.
    pub fn dependency_graph_dot(
        &self,
        requests: &[Requirement],
        tree_mode: bool,
        filename: Option<&Path>,
    ) -> InstallResult<PathBuf> {
        let requested = self.lookup(requests)?;
        let resolution = self.resolver(self.inventory.as_ref()).resolve(
            &requested,
            ResolveOptions {
                ignore_installed: true,
                nodeps_update: false,
                strict: true,
            },
        )?;
        let target = self
            .layout
            .graphs_dir()
            .join(filename.unwrap_or_else(|| Path::new("dependencies")));
        Ok(resolution.graph.generate_dot(tree_mode, &target)?)
    }

    pub fn list_provides(&self, pattern: &str) -> InstallResult<Vec<PackageRef>> {
        Ok(self.repository.list_provides(pattern)?)
    }
}

/// Drops archives fetched for committed packages. Archives found in a
/// cache directory are left alone.
fn discard_fetched_archives(report: &TransactionReport, downloads: &DownloadReport) {
    for id in report.committed() {
        let Some(artifact) = downloads.artifacts.get(id) else {
            continue;
        };
        if artifact.source != ArtifactSource::Downloaded {
            continue;
        }
        if let Err(err) = remove_file_if_exists(&artifact.path) {
            debug!(
                path = %artifact.path.display(),
                error = %err,
                "failed to discard downloaded archive"
            );
        }
    }
}

/// Adds installed dependencies of `removal` that nothing outside it needs.
fn prune_unused_dependencies(removal: &mut Vec<InstalledRecord>, installed: &[InstalledRecord]) {
    loop {
        let mut added = false;
        for candidate in installed {
            if removal.iter().any(|record| record.id() == candidate.id()) {
                continue;
            }
            let needed_by_removal = removal.iter().any(|record| {
                record
                    .package
                    .requires
                    .iter()
                    .any(|requirement| candidate.package.fulfills(requirement))
            });
            if !needed_by_removal {
                continue;
            }
            let still_needed = installed
                .iter()
                .filter(|other| other.id() != candidate.id())
                .filter(|other| !removal.iter().any(|record| record.id() == other.id()))
                .any(|other| {
                    other
                        .package
                        .requires
                        .iter()
                        .any(|requirement| candidate.package.fulfills(requirement))
                });
            if still_needed {
                continue;
            }
            debug!(package = %candidate.id(), "dependency no longer needed");
            removal.push(candidate.clone());
            added = true;
        }
        if !added {
            break;
        }
    }
}

/// Dependents before their dependencies.
fn removal_order(records: Vec<InstalledRecord>) -> Vec<InstalledRecord> {
    let mut graph = DependencyGraph::new();
    for record in &records {
        graph.add_vertex(record.package.clone());
    }
    for record in &records {
        for requirement in &record.package.requires {
            for provider in records
                .iter()
                .filter(|other| other.id() != record.id())
                .filter(|other| other.package.fulfills(requirement))
            {
                graph.add_edge(&record.package, &provider.package);
            }
        }
    }

    let mut ordered = Vec::with_capacity(records.len());
    for package in graph.package_order().into_iter().rev() {
        if let Some(record) = records.iter().find(|record| record.id() == &package.id) {
            ordered.push(record.clone());
        }
    }
    ordered
}
