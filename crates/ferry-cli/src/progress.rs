//! Progress bars for running transfers.

use console::style;
use ferry_core::{GroupOutcome, RecipientId, RecipientStatus, TransferHandle};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

const RECIPIENT_TEMPLATE: &str =
    "{prefix:>12.bold} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {msg}";
const OVERALL_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] overall {percent:>3}% ({msg})";

fn style_or_default(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// One bar per recipient plus an overall line
pub struct GroupProgress {
    _multi: MultiProgress,
    overall: ProgressBar,
    recipients: Vec<(RecipientId, ProgressBar)>,
}

impl GroupProgress {
    /// Bars for `recipients` sending `file_size` bytes each.
    #[must_use]
    pub fn new(file_size: u64, recipients: &[RecipientId]) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(100));
        overall.set_style(style_or_default(OVERALL_TEMPLATE));
        overall.enable_steady_tick(Duration::from_millis(120));

        let recipients = recipients
            .iter()
            .map(|id| {
                let bar = multi.add(ProgressBar::new(file_size));
                bar.set_style(style_or_default(RECIPIENT_TEMPLATE));
                bar.set_prefix(id.to_string());
                bar.set_message(RecipientStatus::Pending.to_string());
                (id.clone(), bar)
            })
            .collect();

        Self {
            _multi: multi,
            overall,
            recipients,
        }
    }

    /// Pull current state from the handle.
    pub fn refresh(&self, handle: &TransferHandle) {
        let aggregate = handle.progress();
        self.overall.set_position(aggregate.percent.round() as u64);
        self.overall.set_message(format!(
            "{} active, {} done, {} failed",
            aggregate.active, aggregate.completed, aggregate.failed
        ));
        for (id, bar) in &self.recipients {
            if let Some(session) = handle.session(id) {
                let progress = session.progress();
                bar.set_position(progress.bytes_sent);
                bar.set_message(progress.status.to_string());
            }
        }
    }

    /// Freeze the bars with the final per-recipient result.
    pub fn finish(&self, outcome: &GroupOutcome) {
        for (id, bar) in &self.recipients {
            if outcome.succeeded.contains(id) {
                bar.finish_with_message(style("verified").green().to_string());
            } else {
                let reason = outcome
                    .failed
                    .iter()
                    .find(|f| f.recipient == *id)
                    .map_or_else(|| "failed".to_string(), |f| f.error.to_string());
                bar.abandon_with_message(style(reason).red().to_string());
            }
        }
        self.overall.finish_with_message(outcome.status.to_string());
    }
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format a rate in bytes/sec
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let secs = duration.as_secs();

    if secs == 0 {
        format!("{millis}ms")
    } else if secs < 60 {
        format!("{}.{:01}s", secs, duration.subsec_millis() / 100)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
