use anyhow::{anyhow, Result};
use sitepack_core::InstalledFilter;
use sitepack_installer::{
    InstallError, InstallOptions, InstallResult, Installer, InstallerConfig, RemoveOptions,
    TransactionReport, UpdateOptions,
};
use tracing::debug;

use crate::render::{
    format_check_lines, format_installed_lines, installed_json, TerminalRenderer,
};
use crate::{parse_spec, parse_specs, Cli, Commands};

/// Runs one command. `Ok(false)` means it ran but did not fully succeed.
pub(crate) fn run_cli(cli: Cli) -> Result<bool> {
    let config = load_config(&cli)?;
    let installer = Installer::open(config)?;
    let renderer = TerminalRenderer::current();

    match cli.command {
        Commands::Install {
            specs,
            flags,
            overwrite,
            nodeps,
            download_only,
        } => {
            let requests = parse_specs(&specs)?;
            let progress = renderer.start_progress("install");
            let result = installer.install(
                &requests,
                InstallOptions {
                    just_db: flags.just_db,
                    overwrite,
                    dry_run: flags.dry_run,
                    nodeps,
                    download_only,
                },
            );
            progress.finish();
            finish_transaction(renderer, result)
        }
        Commands::Remove {
            specs,
            flags,
            force,
            with_deps,
        } => {
            let requests = parse_specs(&specs)?;
            let result = installer.remove(
                &requests,
                RemoveOptions {
                    just_db: flags.just_db,
                    force,
                    nodeps: !with_deps,
                    dry_run: flags.dry_run,
                },
            );
            finish_transaction(renderer, result)
        }
        Commands::Update {
            specs,
            flags,
            with_deps,
        } => {
            let requests = parse_specs(&specs)?;
            let progress = renderer.start_progress("update");
            let result = installer.update(
                &requests,
                UpdateOptions {
                    just_db: flags.just_db,
                    dry_run: flags.dry_run,
                    nodeps: !with_deps,
                },
            );
            progress.finish();
            finish_transaction(renderer, result)
        }
        Commands::Reinstall { specs, flags } => {
            let requests = parse_specs(&specs)?;
            let progress = renderer.start_progress("reinstall");
            let result = installer.reinstall(
                &requests,
                UpdateOptions {
                    just_db: flags.just_db,
                    dry_run: flags.dry_run,
                    nodeps: true,
                },
            );
            progress.finish();
            finish_transaction(renderer, result)
        }
        Commands::Check { specs } => {
            let requests = parse_specs(&specs)?;
            let problems = installer.check(&requests)?;
            if problems.is_empty() {
                renderer.print_status("ok", "all installed files verified");
                return Ok(true);
            }
            for line in format_check_lines(&problems) {
                renderer.print_status("problem", &line);
            }
            Ok(false)
        }
        Commands::List { name, json } => {
            let filter = match name {
                Some(name) => InstalledFilter {
                    name: Some(name),
                    ..InstalledFilter::all()
                },
                None => InstalledFilter::all(),
            };
            let records = installer.list_installed(&filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&installed_json(&records))?);
            } else {
                renderer.print_lines(&format_installed_lines(&records));
            }
            Ok(true)
        }
        Commands::Deps { spec } => {
            let request = parse_spec(&spec)?;
            let lines: Vec<String> = installer
                .list_dependencies(&request)?
                .iter()
                .map(|package| package.id.to_string())
                .collect();
            renderer.print_lines(&lines);
            Ok(true)
        }
        Commands::Graph {
            specs,
            tree,
            output,
        } => {
            let requests = parse_specs(&specs)?;
            let path = installer.dependency_graph_dot(&requests, tree, output.as_deref())?;
            renderer.print_status("graph", &path.display().to_string());
            Ok(true)
        }
        Commands::Provides { pattern } => {
            let lines: Vec<String> = installer
                .list_provides(&pattern)?
                .iter()
                .map(|package| package.id.to_string())
                .collect();
            renderer.print_lines(&lines);
            Ok(true)
        }
    }
}

/// Site config with command-line overrides applied.
pub(crate) fn load_config(cli: &Cli) -> Result<InstallerConfig> {
    let root = cli
        .root
        .clone()
        .ok_or_else(|| anyhow!("no site root, pass --root or set MYSITEROOT"))?;
    let mut config = InstallerConfig::load(&root)?;
    if let Some(registry) = &cli.registry {
        config.registry = Some(registry.clone());
    }
    if !cli.cache_dirs.is_empty() {
        config.cache_dirs = cli.cache_dirs.clone();
    }
    if let Some(jobs) = cli.jobs {
        config.workers = jobs.max(1);
    }
    if cli.no_strict {
        config.strict = false;
    }
    debug!(root = %root.display(), workers = config.workers, strict = config.strict, "configured");
    Ok(config)
}

fn finish_transaction(
    renderer: TerminalRenderer,
    result: InstallResult<TransactionReport>,
) -> Result<bool> {
    match result {
        Ok(report) => {
            renderer.print_report(&report);
            Ok(true)
        }
        Err(InstallError::Incomplete(report)) => {
            renderer.print_report(&report);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}
