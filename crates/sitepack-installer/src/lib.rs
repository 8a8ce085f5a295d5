mod check;
mod config;
mod download;
mod error;
mod extract;
mod fs_utils;
mod installer;
mod inventory;
mod layout;
mod postinstall;
mod transaction;

pub use check::{check_record, CheckProblem, FileProblem};
pub use config::InstallerConfig;
pub use download::{
    Artifact, ArtifactSource, DownloadManager, DownloadReport, Fetcher, HttpFetcher,
    DEFAULT_WORKERS, DOWNLOAD_ATTEMPTS,
};
pub use error::{InstallError, InstallResult};
pub use extract::{Extractor, TarGzExtractor, POST_INSTALL_ENTRY};
pub use installer::{InstallOptions, Installer, RemoveOptions, UpdateOptions};
pub use inventory::ReceiptInventory;
pub use layout::{SiteLayout, SITE_ROOT_ENV};
pub use postinstall::{run_post_install, INSTALL_PREFIX_ENV};
pub use transaction::{
    EngineOptions, InstallPlan, PackageOutcome, TransactionEngine, TransactionKind,
    TransactionReport,
};

#[cfg(test)]
mod tests;
