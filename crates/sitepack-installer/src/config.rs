use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sitepack_resolver::DEFAULT_IGNORED_PACKAGES;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::download::DEFAULT_WORKERS;
use crate::layout::SiteLayout;

/// Settings read from `<root>/etc/sitepack.toml`. Relative paths are
/// resolved against the site root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    #[serde(skip)]
    pub root: PathBuf,
    pub registry: Option<PathBuf>,
    pub cache_dirs: Vec<PathBuf>,
    pub workers: usize,
    pub strict: bool,
    pub ignored_packages: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            registry: None,
            cache_dirs: Vec::new(),
            workers: DEFAULT_WORKERS,
            strict: true,
            ignored_packages: DEFAULT_IGNORED_PACKAGES
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

impl InstallerConfig {
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(root: impl Into<PathBuf>, content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).context("failed parsing installer config")?;
        config.root = root.into();
        if config.workers == 0 {
            config.workers = DEFAULT_WORKERS;
        }
        Ok(config)
    }

    /// Defaults when the config file is absent.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let path = SiteLayout::new(&root).config_path();
        match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml_str(root, &content)
                .with_context(|| format!("invalid config: {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::for_root(root)),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read config: {}", path.display()))
            }
        }
    }

    pub fn layout(&self) -> SiteLayout {
        SiteLayout::new(&self.root)
    }

    pub fn registry_path(&self) -> Option<PathBuf> {
        self.registry.as_deref().map(|path| self.resolve(path))
    }

    pub fn cache_paths(&self) -> Vec<PathBuf> {
        self.cache_dirs.iter().map(|path| self.resolve(path)).collect()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}
