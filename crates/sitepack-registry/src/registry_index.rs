use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use sitepack_core::{PackageManifest, PackageRef, RepositoryClient, Requirement};
use tracing::debug;

/// A directory of package manifests laid out as `index/<name>/*.toml`.
#[derive(Debug, Clone)]
pub struct RegistryIndex {
    root: PathBuf,
}

impl RegistryIndex {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_root(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn package_names(&self) -> Result<Vec<String>> {
        let index_root = self.index_root();
        if !index_root.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&index_root)
            .with_context(|| format!("failed to read registry index: {}", index_root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// All versions of `package`, newest first. Names that cannot be an
    /// index directory, such as file paths, have no versions.
    pub fn package_versions(&self, package: &str) -> Result<Vec<PackageRef>> {
        if !is_index_name(package) {
            return Ok(Vec::new());
        }
        let package_dir = self.index_root().join(package);
        if !package_dir.exists() {
            return Ok(Vec::new());
        }

        let mut packages = Vec::new();
        for entry in fs::read_dir(&package_dir)
            .with_context(|| format!("failed to read package directory: {package}"))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some("toml") {
                continue;
            }

            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed reading manifest: {}", path.display()))?;
            let manifest = PackageManifest::from_toml_str(&content)
                .with_context(|| format!("failed parsing manifest: {}", path.display()))?;
            if manifest.name != package {
                anyhow::bail!(
                    "manifest {} declares package '{}' but is stored under '{}'",
                    path.display(),
                    manifest.name,
                    package
                );
            }
            let url = self.resolve_url(&manifest.url);
            let descriptor = manifest
                .into_package(url)
                .with_context(|| format!("invalid manifest: {}", path.display()))?;
            packages.push(descriptor);
        }

        packages.sort_by(|a, b| b.id.cmp_evr(&a.id));
        Ok(packages)
    }

    fn all_packages(&self) -> Result<Vec<PackageRef>> {
        let mut packages = Vec::new();
        for name in self.package_names()? {
            packages.extend(self.package_versions(&name)?);
        }
        Ok(packages)
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.contains("://") || Path::new(url).is_absolute() {
            return url.to_string();
        }
        self.root.join(url).to_string_lossy().to_string()
    }
}

fn is_index_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

impl RepositoryClient for RegistryIndex {
    fn find_latest_matching(&self, requirement: &Requirement) -> Result<Option<PackageRef>> {
        let by_name = self
            .package_versions(&requirement.name)?
            .into_iter()
            .find(|package| package.fulfills(requirement));
        if by_name.is_some() {
            return Ok(by_name);
        }

        let mut providers: Vec<PackageRef> = self
            .all_packages()?
            .into_iter()
            .filter(|package| package.name() != requirement.name)
            .filter(|package| package.fulfills(requirement))
            .collect();
        providers.sort_by(|a, b| {
            b.id.cmp_evr(&a.id)
                .then_with(|| a.name().cmp(b.name()))
        });
        let best = providers.into_iter().next();
        if let Some(provider) = &best {
            debug!(requirement = %requirement, provider = %provider, "resolved through provides");
        }
        Ok(best)
    }

    fn list_provides(&self, name_pattern: &str) -> Result<Vec<PackageRef>> {
        let pattern = Regex::new(name_pattern)
            .with_context(|| format!("invalid provides pattern '{name_pattern}'"))?;
        Ok(self
            .all_packages()?
            .into_iter()
            .filter(|package| {
                pattern.is_match(package.name())
                    || package
                        .provides
                        .iter()
                        .any(|capability| pattern.is_match(&capability.name))
            })
            .collect())
    }
}
