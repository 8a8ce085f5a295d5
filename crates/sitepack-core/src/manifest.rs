use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveFormat;
use crate::package::{PackageId, PackageRef};
use crate::requirement::{Capability, Requirement};

/// One version-release of a package as stored in a registry index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default = "default_release")]
    pub release: String,
    pub url: String,
    pub sha256: Option<String>,
    pub archive: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    pub post_install: Option<String>,
}

fn default_release() -> String {
    "1".to_string()
}

impl PackageManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse sitepack manifest")?;
        if manifest.name.trim().is_empty() {
            return Err(anyhow!("manifest name must not be empty"));
        }
        if manifest.name.contains(char::is_whitespace) {
            return Err(anyhow!(
                "manifest name '{}' must not contain whitespace",
                manifest.name
            ));
        }
        if manifest.version.trim().is_empty() {
            return Err(anyhow!("manifest '{}' has an empty version", manifest.name));
        }
        if manifest.url.trim().is_empty() {
            return Err(anyhow!("manifest '{}' has an empty url", manifest.name));
        }
        if let Some(sha256) = &manifest.sha256 {
            if sha256.len() != 64 || !sha256.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(anyhow!(
                    "manifest '{}' sha256 must be 64 hex characters",
                    manifest.name
                ));
            }
        }
        Ok(manifest)
    }

    /// Builds the package descriptor, with `download_url` already resolved
    /// against wherever the manifest was found.
    pub fn into_package(self, download_url: String) -> anyhow::Result<PackageRef> {
        let archive = match &self.archive {
            Some(raw) => ArchiveFormat::parse(raw).ok_or_else(|| {
                anyhow!("manifest '{}' has unsupported archive '{}'", self.name, raw)
            })?,
            None => ArchiveFormat::infer_from_url(&download_url).unwrap_or_default(),
        };

        let requires = self
            .requires
            .iter()
            .map(|raw| {
                Requirement::parse(raw)
                    .with_context(|| format!("invalid requires entry for '{}'", self.name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let provides = self
            .provides
            .iter()
            .map(|raw| {
                Capability::parse(raw)
                    .with_context(|| format!("invalid provides entry for '{}'", self.name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut package = PackageRef::new(PackageId::new(
            self.name.as_str(),
            self.version.as_str(),
            self.release.as_str(),
        ));
        package.requires = requires;
        package.provides = provides;
        package.post_install_script = self.post_install.map(String::into_bytes);
        package.download_url = download_url;
        package.sha256 = self.sha256.map(|value| value.to_ascii_lowercase());
        package.archive = archive;
        Ok(package)
    }
}
