use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use sitepack_core::{Requirement, Version};
use sitepack_installer::InstallError;
use tracing_subscriber::EnvFilter;

mod dispatch;
mod render;

use dispatch::run_cli;

#[derive(Parser, Debug)]
#[command(name = "sitepack")]
#[command(
    about = "Install packages and their dependencies into a site root",
    long_about = None,
    version
)]
struct Cli {
    /// Site root to operate on
    #[arg(long, env = "MYSITEROOT", global = true)]
    root: Option<PathBuf>,
    /// Registry directory, overrides etc/sitepack.toml
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    /// Directory searched for already downloaded archives (repeatable)
    #[arg(long = "cache-dir", global = true)]
    cache_dirs: Vec<PathBuf>,
    /// Parallel downloads
    #[arg(long, short = 'j', global = true)]
    jobs: Option<usize>,
    /// Install even when some dependencies cannot be resolved
    #[arg(long, global = true)]
    no_strict: bool,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Copy, Default)]
struct TransactionFlags {
    /// Print the plan without changing anything
    #[arg(long)]
    dry_run: bool,
    /// Only update the installed-package records
    #[arg(long)]
    just_db: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        #[arg(required = true)]
        specs: Vec<String>,
        #[command(flatten)]
        flags: TransactionFlags,
        #[arg(long)]
        overwrite: bool,
        /// Install only the named packages
        #[arg(long)]
        nodeps: bool,
        #[arg(long)]
        download_only: bool,
    },
    Remove {
        #[arg(required = true)]
        specs: Vec<String>,
        #[command(flatten)]
        flags: TransactionFlags,
        /// Remove even if other installed packages depend on these
        #[arg(long)]
        force: bool,
        /// Also remove dependencies nothing else needs
        #[arg(long)]
        with_deps: bool,
    },
    Update {
        #[arg(required = true)]
        specs: Vec<String>,
        #[command(flatten)]
        flags: TransactionFlags,
        /// Update installed dependencies too
        #[arg(long)]
        with_deps: bool,
    },
    Reinstall {
        #[arg(required = true)]
        specs: Vec<String>,
        #[command(flatten)]
        flags: TransactionFlags,
    },
    /// Verify installed files, all packages when none are named
    Check { specs: Vec<String> },
    List {
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Deps { spec: String },
    /// Write the dependency graph in graphviz format
    Graph {
        #[arg(required = true)]
        specs: Vec<String>,
        #[arg(long)]
        tree: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Provides { pattern: String },
}

/// Parses `name[-version[-release]]`; the version starts at the first `-`
/// followed by a digit. Specs with a comparison operator are read as
/// requirements.
fn parse_spec(spec: &str) -> Result<Requirement> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(anyhow!("package spec must not be empty"));
    }
    if spec.contains(['<', '>', '=', ' ']) {
        return Requirement::parse(spec);
    }

    let split = spec
        .char_indices()
        .find(|(index, ch)| {
            *ch == '-'
                && spec[index + 1..]
                    .chars()
                    .next()
                    .is_some_and(|next| next.is_ascii_digit())
        })
        .map(|(index, _)| index);
    let Some(index) = split else {
        return Ok(Requirement::any(spec));
    };

    let name = &spec[..index];
    if name.is_empty() {
        return Err(anyhow!("package spec '{spec}' has no name"));
    }
    let evr = &spec[index + 1..];
    let (version, release) = match evr.split_once('-') {
        Some((version, release)) => (version, Some(Version::parse(release))),
        None => (evr, None),
    };
    Ok(Requirement::exact(name, Version::parse(version), release))
}

fn parse_specs(specs: &[String]) -> Result<Vec<Requirement>> {
    specs.iter().map(|spec| parse_spec(spec)).collect()
}

fn default_log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_cli(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            render::print_error(&err);
            match err.downcast_ref::<InstallError>() {
                Some(InstallError::Usage(_)) | Some(InstallError::NotFound(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
