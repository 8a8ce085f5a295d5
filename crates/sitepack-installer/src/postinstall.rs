use anyhow::{Context, Result};
use sitepack_core::{PackageId, PostInstallStatus};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::layout::{SiteLayout, SITE_ROOT_ENV};

pub const INSTALL_PREFIX_ENV: &str = "RPM_INSTALL_PREFIX";

fn interpreter() -> PathBuf {
    let bash = Path::new("/bin/bash");
    if bash.exists() {
        bash.to_path_buf()
    } else {
        PathBuf::from("/bin/sh")
    }
}

/// Runs a package's post-install script against the site root. Failures are
/// reported through the returned status, never as an error.
pub fn run_post_install(layout: &SiteLayout, id: &PackageId, script: &[u8]) -> PostInstallStatus {
    match run_script(layout, script) {
        Ok(output) if output.status.success() => {
            info!(package = %id, "post-install script succeeded");
            debug!(
                package = %id,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "post-install output"
            );
            PostInstallStatus::Success
        }
        Ok(output) => {
            warn!(
                package = %id,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "post-install script failed"
            );
            PostInstallStatus::Error
        }
        Err(err) => {
            warn!(package = %id, error = %format!("{err:#}"), "post-install script could not run");
            PostInstallStatus::Error
        }
    }
}

fn run_script(layout: &SiteLayout, script: &[u8]) -> Result<std::process::Output> {
    let tmp_dir = layout.tmp_state_dir();
    std::fs::create_dir_all(&tmp_dir)
        .with_context(|| format!("failed to create {}", tmp_dir.display()))?;

    let mut file = tempfile::Builder::new()
        .prefix("post-install-")
        .suffix(".sh")
        .tempfile_in(&tmp_dir)
        .context("failed to create post-install script file")?;
    file.write_all(script)
        .context("failed to write post-install script")?;
    file.flush().context("failed to write post-install script")?;

    let shell = interpreter();
    Command::new(&shell)
        .arg(file.path())
        .current_dir(layout.root())
        .env(SITE_ROOT_ENV, layout.root())
        .env(INSTALL_PREFIX_ENV, layout.root())
        .output()
        .with_context(|| format!("failed to start {}", shell.display()))
}
