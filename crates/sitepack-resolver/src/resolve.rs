use std::collections::HashSet;
use std::fmt;

use anyhow::{Context, Result};
use sitepack_core::{
    InstalledFilter, LocalInventory, PackageId, PackageRef, RepositoryClient, Requirement,
};
use tracing::{debug, info, warn};

use crate::graph::DependencyGraph;

/// Requirement names that are provided by the host rather than by packages.
/// A trailing `*` matches by prefix.
pub const DEFAULT_IGNORED_PACKAGES: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/usr/bin/env",
    "/usr/bin/perl",
    "/usr/bin/python",
    "rpmlib(*",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub package: PackageId,
    pub dependency: Requirement,
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (required by {})", self.dependency, self.package)
    }
}

/// A requirement met by something already installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatisfiedRequirement {
    pub package: PackageId,
    pub dependency: Requirement,
    pub provider: PackageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub ignore_installed: bool,
    pub nodeps_update: bool,
    pub strict: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            ignore_installed: false,
            nodeps_update: false,
            strict: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub graph: DependencyGraph,
    pub missing: Vec<MissingDependency>,
    pub satisfied: Vec<SatisfiedRequirement>,
    pub already_installed: Vec<PackageId>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub struct Resolver<'a> {
    repository: &'a dyn RepositoryClient,
    inventory: &'a dyn LocalInventory,
    ignored: Vec<String>,
}

struct ResolveState<'r> {
    requested: &'r [PackageRef],
    skipped: HashSet<PackageId>,
    options: ResolveOptions,
    visited: HashSet<PackageId>,
    resolution: Resolution,
}

impl<'a> Resolver<'a> {
    pub fn new(
        repository: &'a dyn RepositoryClient,
        inventory: &'a dyn LocalInventory,
        ignored: Vec<String>,
    ) -> Self {
        Self {
            repository,
            inventory,
            ignored,
        }
    }

    pub fn with_default_ignores(
        repository: &'a dyn RepositoryClient,
        inventory: &'a dyn LocalInventory,
    ) -> Self {
        Self::new(
            repository,
            inventory,
            DEFAULT_IGNORED_PACKAGES
                .iter()
                .map(|name| name.to_string())
                .collect(),
        )
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        })
    }

    /// Expands `requested` into the full set of packages to install.
    ///
    /// Unsatisfied requirements never fail resolution; they are collected in
    /// `Resolution::missing` (strict) or logged.
    pub fn resolve(&self, requested: &[PackageRef], options: ResolveOptions) -> Result<Resolution> {
        let mut state = ResolveState {
            requested,
            skipped: HashSet::new(),
            options,
            visited: HashSet::new(),
            resolution: Resolution::default(),
        };

        if !options.ignore_installed {
            for package in requested {
                if self.inventory.is_installed(&package.id)? {
                    warn!(package = %package.id, "already installed, use reinstall");
                    state.skipped.insert(package.id.clone());
                    state.resolution.already_installed.push(package.id.clone());
                }
            }
        }

        for package in requested {
            if state.skipped.contains(&package.id) {
                continue;
            }
            state.resolution.graph.add_vertex(package.clone());
            self.expand(package, &mut state)?;
        }

        Ok(state.resolution)
    }

    fn expand(&self, package: &PackageRef, state: &mut ResolveState<'_>) -> Result<()> {
        if !state.visited.insert(package.id.clone()) {
            return Ok(());
        }

        let requested = state.requested;
        for requirement in &package.requires {
            if self.is_ignored(&requirement.name) {
                continue;
            }

            if let Some(other) = requested
                .iter()
                .find(|other| other.id != package.id && other.fulfills(requirement))
            {
                if state.skipped.contains(&other.id) {
                    state.resolution.satisfied.push(SatisfiedRequirement {
                        package: package.id.clone(),
                        dependency: requirement.clone(),
                        provider: other.id.clone(),
                    });
                } else {
                    debug!(
                        requirement = %requirement,
                        provider = %other.id,
                        "already fulfilled by a requested package"
                    );
                    state.resolution.graph.add_edge(package, other);
                }
                continue;
            }

            if !state.options.ignore_installed && !state.options.nodeps_update {
                let provider = self
                    .inventory
                    .find_provider(requirement)
                    .with_context(|| format!("failed to look up installed '{requirement}'"))?;
                if let Some(provider) = provider {
                    info!(requirement = %requirement, "already available on local system");
                    state.resolution.satisfied.push(SatisfiedRequirement {
                        package: package.id.clone(),
                        dependency: requirement.clone(),
                        provider: provider.id,
                    });
                    continue;
                }
            }

            let candidate = self
                .repository
                .find_latest_matching(requirement)
                .with_context(|| format!("failed to query repository for '{requirement}'"))?;
            let Some(candidate) = candidate else {
                if state.options.strict {
                    state.resolution.missing.push(MissingDependency {
                        package: package.id.clone(),
                        dependency: requirement.clone(),
                    });
                    state
                        .resolution
                        .graph
                        .add_missing_dependency(package, requirement);
                } else {
                    warn!(
                        package = %package.id,
                        requirement = %requirement,
                        "no package provides requirement"
                    );
                }
                continue;
            };

            if let Some(installed) = self.installed_in_place_of(&candidate, requirement, state)? {
                state.resolution.satisfied.push(SatisfiedRequirement {
                    package: package.id.clone(),
                    dependency: requirement.clone(),
                    provider: installed,
                });
                continue;
            }

            state.resolution.graph.add_edge(package, &candidate);
            if !state.visited.contains(&candidate.id) {
                self.expand(&candidate, state)?;
            }
        }

        Ok(())
    }

    /// An installed package that makes installing `candidate` unnecessary:
    /// the candidate itself, or a newer build of the same name.
    fn installed_in_place_of(
        &self,
        candidate: &PackageRef,
        requirement: &Requirement,
        state: &ResolveState<'_>,
    ) -> Result<Option<PackageId>> {
        let installed = self
            .inventory
            .get_installed(&InstalledFilter::named(candidate.name()))?;

        if !state.options.ignore_installed
            && installed.iter().any(|record| record.id() == &candidate.id)
        {
            return Ok(Some(candidate.id.clone()));
        }

        let newer = installed
            .into_iter()
            .filter(|record| record.id().cmp_evr(&candidate.id).is_gt())
            .find(|record| record.package.fulfills(requirement));
        if let Some(record) = newer {
            warn!(
                installed = %record.id(),
                candidate = %candidate.id,
                "keeping newer installed package"
            );
            return Ok(Some(record.package.id));
        }
        Ok(None)
    }

    /// Every package `request` pulls in from the repository, dependencies
    /// first. Installed providers are not consulted.
    pub fn dependencies(&self, request: &PackageRef) -> Result<Vec<PackageRef>> {
        let resolution = self.resolve(
            std::slice::from_ref(request),
            ResolveOptions {
                ignore_installed: true,
                nodeps_update: false,
                strict: false,
            },
        )?;
        Ok(resolution
            .graph
            .package_order()
            .into_iter()
            .filter(|package| package.id != request.id)
            .collect())
    }
}
