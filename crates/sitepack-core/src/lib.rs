mod archive;
mod inventory;
mod manifest;
mod package;
mod repository;
mod requirement;
mod version;

pub use archive::ArchiveFormat;
pub use inventory::{InstalledFilter, InstalledRecord, LocalInventory, PostInstallStatus};
pub use manifest::PackageManifest;
pub use package::{FileEntry, PackageId, PackageRef};
pub use repository::RepositoryClient;
pub use requirement::{Capability, Comparison, Requirement};
pub use version::Version;
