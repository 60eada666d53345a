use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use marketplace_installer::{
    JobStatus, JobView, MarketplaceConfig, RegistryEntry, SweepReport,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct DownloadProgress {
    style: OutputStyle,
    label: String,
    current: u64,
    total: Option<u64>,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str) -> DownloadProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(1);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<12} [{bar:24.cyan/blue}] {bytes:>10}/{total_bytes:10} {elapsed_precise}",
            ) {
                progress_bar.set_style(style.tick_chars(".oO@* ").progress_chars("=>-"));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        DownloadProgress {
            style: self.style,
            label: label.to_string(),
            current: 0,
            total: None,
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl DownloadProgress {
    pub(crate) fn set(&mut self, current: u64, total: Option<u64>) {
        self.current = current;
        if total.is_some() {
            self.total = total;
        }

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };
        let length = self.total.unwrap_or(current).max(1);
        progress_bar.set_length(length);
        progress_bar.set_position(current.min(length));
    }

    pub(crate) fn suspend<F: FnOnce()>(&self, f: F) {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.suspend(f),
            None => f(),
        }
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.current,
            self.total.unwrap_or(self.current),
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status.to_ascii_uppercase()),
    }
}

pub(crate) fn status_badge(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Succeeded => "ok",
        JobStatus::Failed => "err",
        JobStatus::Cancelled => "warn",
        _ => "step",
    }
}

pub(crate) fn format_transition_line(view: &JobView) -> String {
    format!(
        "{} {}: {}",
        view.kind.as_str(),
        view.app_id,
        view.status.as_str()
    )
}

pub(crate) fn format_job_outcome_lines(view: &JobView, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        status_badge(view.status),
        &format!(
            "{} {} {} (job {})",
            view.kind.as_str(),
            view.app_id,
            view.status.as_str(),
            view.job_id
        ),
    )];
    if let Some(error) = &view.error {
        lines.push(format!("  {}: {}", error.kind.as_str(), error.message));
    }
    lines
}

pub(crate) fn format_registry_lines(entries: &[RegistryEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["No applications installed".to_string()];
    }
    entries
        .iter()
        .map(|entry| {
            format!(
                "{} {} ({}) sha256={}",
                entry.app_id, entry.version, entry.name, entry.content_sha256
            )
        })
        .collect()
}

pub(crate) fn format_sweep_lines(report: &SweepReport) -> Vec<String> {
    let mut lines = report
        .removed
        .iter()
        .map(|path| format!("removed {}", path.display()))
        .collect::<Vec<_>>();
    lines.push(format!(
        "sweep summary: removed={} skipped-active={} skipped-recent={}",
        report.removed.len(),
        report.skipped_active,
        report.skipped_recent
    ));
    lines
}

pub(crate) fn format_config_lines(config: &MarketplaceConfig) -> Vec<String> {
    vec![
        format!("root: {}", config.root.display()),
        format!("max-artifact-bytes: {}", config.max_artifact_bytes),
        format!("lock-lease: {}s", config.lock_lease.as_secs()),
        format!("lock-wait: {}s", config.lock_wait_timeout.as_secs()),
        format!("retry-max-attempts: {}", config.retry.max_attempts),
        format!("retry-base-delay: {}ms", config.retry.base_delay.as_millis()),
        format!("retry-max-delay: {}ms", config.retry.max_delay.as_millis()),
        format!("fetch-timeout: {}s", config.fetch_timeout.as_secs()),
        format!("staging-grace: {}s", config.staging_grace.as_secs()),
        format!("job-retention: {}s", config.job_retention.as_secs()),
        format!("sweep-interval: {}s", config.sweep_interval.as_secs()),
    ]
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as u128 * width as u128) / safe_total as u128) as usize;
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current as u128 * 100) / safe_total as u128;
    let counts = format!("{}/{}", HumanBytes(current), HumanBytes(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
