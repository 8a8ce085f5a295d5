//! Failures surfaced by the installer entry points.

use sitepack_core::PackageId;
use sitepack_resolver::MissingDependency;
use thiserror::Error;

use crate::transaction::TransactionReport;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("unresolved dependencies: {}", join_display(.0))]
    Resolution(Vec<MissingDependency>),

    #[error("no package matching '{0}'")]
    NotFound(String),

    #[error("{0}")]
    Usage(String),

    #[error("cannot remove {package}: required by {}", join_display(.dependents))]
    BlockedByDependents {
        package: PackageId,
        dependents: Vec<PackageId>,
    },

    #[error("transaction incomplete: {0}")]
    Incomplete(TransactionReport),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type InstallResult<T> = std::result::Result<T, InstallError>;

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
