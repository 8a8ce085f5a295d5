use anyhow::{Context, Result};
use sitepack_core::{FileEntry, PackageId};
use std::fs;
use std::path::{Path, PathBuf};

pub const SITE_ROOT_ENV: &str = "MYSITEROOT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLayout {
    root: PathBuf,
}

impl SiteLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn config_path(&self) -> PathBuf {
        self.etc_dir().join("sitepack.toml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("var").join("sitepack")
    }

    pub fn installed_state_dir(&self) -> PathBuf {
        self.state_dir().join("installed")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir().join("cache")
    }

    pub fn packages_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("packages")
    }

    pub fn tmp_state_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn graphs_dir(&self) -> PathBuf {
        self.state_dir().join("graphs")
    }

    pub fn receipt_path(&self, id: &PackageId) -> PathBuf {
        self.installed_state_dir().join(format!("{id}.receipt"))
    }

    pub fn files_path(&self, id: &PackageId) -> PathBuf {
        self.installed_state_dir().join(format!("{id}.files"))
    }

    /// Where a manifest entry lives on disk.
    pub fn entry_path(&self, entry: &FileEntry) -> PathBuf {
        self.root.join(entry.relative_path())
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.etc_dir(),
            self.state_dir(),
            self.installed_state_dir(),
            self.cache_dir(),
            self.packages_cache_dir(),
            self.tmp_state_dir(),
            self.graphs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
