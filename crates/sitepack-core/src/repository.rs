use crate::package::PackageRef;
use crate::requirement::Requirement;

/// Source of installable package descriptors.
pub trait RepositoryClient {
    /// The highest version-release that satisfies `requirement`, if any.
    fn find_latest_matching(&self, requirement: &Requirement)
        -> anyhow::Result<Option<PackageRef>>;

    /// Every package whose name or provides match `name_pattern`.
    fn list_provides(&self, name_pattern: &str) -> anyhow::Result<Vec<PackageRef>>;
}
