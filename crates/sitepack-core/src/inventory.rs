use crate::package::{FileEntry, PackageId, PackageRef};
use crate::requirement::Requirement;
use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PostInstallStatus {
    #[default]
    NotRun,
    Success,
    Error,
}

impl PostInstallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRun => "not-run",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "not-run" | "N" => Some(Self::NotRun),
            "success" | "Y" => Some(Self::Success),
            "error" | "E" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRecord {
    pub package: PackageRef,
    pub post_install: PostInstallStatus,
    pub installed_at_unix: u64,
}

impl InstalledRecord {
    pub fn id(&self) -> &PackageId {
        &self.package.id
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.package.file_manifest
    }
}

/// Selects installed records by name and optionally version/release.
///
/// With `exact` unset the name is matched as a prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledFilter {
    pub name: Option<String>,
    pub version: Option<Version>,
    pub release: Option<Version>,
    pub exact: bool,
}

impl InstalledFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            exact: true,
            ..Self::default()
        }
    }

    pub fn for_id(id: &PackageId) -> Self {
        Self {
            name: Some(id.name.clone()),
            version: Some(id.version.clone()),
            release: Some(id.release.clone()),
            exact: true,
        }
    }

    pub fn matches(&self, id: &PackageId) -> bool {
        if let Some(name) = &self.name {
            let name_ok = if self.exact {
                id.name == *name
            } else {
                id.name.starts_with(name.as_str())
            };
            if !name_ok {
                return false;
            }
        }
        if self.version.as_ref().is_some_and(|version| *version != id.version) {
            return false;
        }
        if self.release.as_ref().is_some_and(|release| *release != id.release) {
            return false;
        }
        true
    }
}

/// Persistent record of what is installed under a site root.
pub trait LocalInventory {
    fn installed_records(&self) -> anyhow::Result<Vec<InstalledRecord>>;

    /// Stores a record for `package` with the files it placed on disk.
    fn add_record(
        &self,
        package: &PackageRef,
        files: Vec<FileEntry>,
    ) -> anyhow::Result<InstalledRecord>;

    fn remove_record(&self, id: &PackageId) -> anyhow::Result<()>;

    fn set_post_install_status(
        &self,
        id: &PackageId,
        status: PostInstallStatus,
    ) -> anyhow::Result<()>;

    fn get_installed(&self, filter: &InstalledFilter) -> anyhow::Result<Vec<InstalledRecord>> {
        Ok(self
            .installed_records()?
            .into_iter()
            .filter(|record| filter.matches(record.id()))
            .collect())
    }

    fn is_installed(&self, id: &PackageId) -> anyhow::Result<bool> {
        Ok(!self.get_installed(&InstalledFilter::for_id(id))?.is_empty())
    }

    fn find_provider(&self, requirement: &Requirement) -> anyhow::Result<Option<PackageRef>> {
        Ok(self
            .installed_records()?
            .into_iter()
            .map(|record| record.package)
            .filter(|package| package.fulfills(requirement))
            .max_by(|left, right| left.id.cmp_evr(&right.id)))
    }

    /// Installed packages with at least one requirement that `id` fulfills.
    fn find_dependents(&self, id: &PackageId) -> anyhow::Result<Vec<InstalledRecord>> {
        let records = self.installed_records()?;
        let target = records
            .iter()
            .find(|record| record.id() == id)
            .map(|record| record.package.clone())
            .unwrap_or_else(|| PackageRef::new(id.clone()));

        Ok(records
            .into_iter()
            .filter(|record| record.id() != id)
            .filter(|record| {
                record
                    .package
                    .requires
                    .iter()
                    .any(|requirement| target.fulfills(requirement))
            })
            .collect())
    }
}
