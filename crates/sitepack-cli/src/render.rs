use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use sitepack_core::{InstalledRecord, PostInstallStatus};
use sitepack_installer::{CheckProblem, PackageOutcome, TransactionReport};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    if !no_color && std::io::stdout().is_terminal() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    spinner: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn print_report(self, report: &TransactionReport) {
        for (status, message) in report_lines(report) {
            self.print_status(status, &message);
        }
        self.print_status("summary", &report.summary());
    }

    pub(crate) fn start_progress(self, label: &str) -> TerminalProgress {
        let spinner = if self.style == OutputStyle::Rich {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
                spinner.set_style(style.tick_chars(progress_tick_chars(label)));
            }
            spinner.set_message(label.to_string());
            spinner.enable_steady_tick(Duration::from_millis(80));
            Some(spinner)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            spinner,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    pub(crate) fn finish(mut self) {
        let Some(spinner) = self.spinner.take() else {
            return;
        };
        spinner.finish_and_clear();
        println!(
            "{}",
            render_status_line(
                self.style,
                &self.label,
                &format!("done in {}", format_elapsed(self.started_at.elapsed()))
            )
        );
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "update" => "<^>v ",
        "reinstall" => "-=~* ",
        "remove" => "\\|/- ",
        _ => "|/-\\ ",
    }
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "installed" | "removed" | "ok" => AnsiColor::BrightGreen,
        "failed" | "error" | "problem" => AnsiColor::BrightRed,
        "skipped" | "warning" => AnsiColor::BrightYellow,
        _ => AnsiColor::BrightBlue,
    };
    Style::new()
        .fg_color(Some(color.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => format!("{status}: {message}"),
        OutputStyle::Rich => format!(
            "{} {message}",
            colorize(status_style(status), &format!("{status:>10}"))
        ),
    }
}

pub(crate) fn report_lines(report: &TransactionReport) -> Vec<(&'static str, String)> {
    let mut lines = Vec::new();
    for (id, outcome) in &report.outcomes {
        match outcome {
            PackageOutcome::Committed { post_install } => {
                lines.push(("installed", id.to_string()));
                if *post_install == PostInstallStatus::Error {
                    lines.push(("warning", format!("{id}: post-install script failed")));
                }
            }
            PackageOutcome::Removed => lines.push(("removed", id.to_string())),
            PackageOutcome::Failed { reason } => lines.push(("failed", format!("{id}: {reason}"))),
            PackageOutcome::Skipped { reason } => {
                lines.push(("skipped", format!("{id}: {reason}")))
            }
        }
    }
    lines
}

pub(crate) fn format_installed_lines(records: &[InstalledRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let suffix = match record.post_install {
                PostInstallStatus::Error => " (post-install failed)",
                _ => "",
            };
            format!("{}{suffix}", record.id())
        })
        .collect()
}

pub(crate) fn installed_json(records: &[InstalledRecord]) -> serde_json::Value {
    let packages: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            json!({
                "name": record.package.id.name,
                "version": record.package.id.version.as_str(),
                "release": record.package.id.release.as_str(),
                "post_install": record.post_install.as_str(),
                "installed_at_unix": record.installed_at_unix,
                "requires": record
                    .package
                    .requires
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
                "files": record.files().len(),
            })
        })
        .collect();
    json!({ "packages": packages })
}

pub(crate) fn format_check_lines(problems: &[CheckProblem]) -> Vec<String> {
    problems.iter().map(ToString::to_string).collect()
}

pub(crate) fn print_error(err: &anyhow::Error) {
    let style = if std::io::stderr().is_terminal() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    };
    eprintln!("{}", render_status_line(style, "error", &format!("{err:#}")));
}
