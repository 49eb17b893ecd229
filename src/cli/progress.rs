//! Progress bars and summaries for CLI runs.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::lifecycle::FetchProgress;
use crate::stats::{ActivationKind, ActivationReport, CacheStatus, OfflineReport};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Formats a byte count as a human-readable string (B, KB, MB, GB).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Formats a short duration, with millisecond precision below one second.
#[must_use]
pub fn format_elapsed(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else if d < Duration::from_secs(60) {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {:02}s", d.as_secs() / 60, d.as_secs() % 60)
    }
}

/// Progress bar over a batch of resource fetches.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    /// Creates a hidden bar; it is sized when the batch starts.
    #[must_use]
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} resources @ {binary_bytes_per_sec} - {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━━╌"),
        );
        Self { bar }
    }

    /// Clears the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchProgress for BarProgress {
    fn on_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.enable_steady_tick(Duration::from_millis(250));
    }

    fn on_fetched(&self, url: &str, _bytes: u64) {
        self.bar.inc(1);
        self.bar.set_message(url.rsplit('/').next().unwrap_or(url).to_string());
    }

    fn on_error(&self, url: &str, error: &str) {
        self.bar
            .println(format!("{} {url}: {error}", style("failed").red().bold()));
    }
}

/// Prints what an activation did.
pub fn print_activation(report: &ActivationReport) {
    println!("\n{SEPARATOR}");
    match &report.kind {
        ActivationKind::Fresh => println!("{}", style("Fresh install").green().bold()),
        ActivationKind::Upgrade => println!("{}", style("Upgrade").green().bold()),
        ActivationKind::Wiped { reason } => {
            println!("{} {reason}", style("Activation failed, cache wiped:").red().bold());
        }
    }
    println!("{SEPARATOR}");
    if report.is_success() {
        println!("  Shell promoted:    {}", report.promoted);
        println!("  Retained:          {}", report.retained.len());
        println!("  Evicted:           {}", report.evicted.len());
    }
    println!("  Took:              {}", format_elapsed(report.elapsed));
    println!("{SEPARATOR}");
}

/// Prints a summary of an offline download.
pub fn print_offline(report: &OfflineReport) {
    println!("\n{SEPARATOR}");
    println!("Offline download");
    println!("{SEPARATOR}");
    println!("  Already cached:    {}", report.already_cached);
    println!("  Fetched:           {}", report.fetched);
    if report.fetched > 0 {
        println!("  Total size:        {}", format_bytes(report.bytes));
        println!("  Total time:        {}", format_elapsed(report.elapsed));
        println!("  Average speed:     {}/s", format_bytes(report.average_speed()));
    }
    println!("{SEPARATOR}");
}

/// Prints the partitions' state relative to the deployment.
pub fn print_status(status: &CacheStatus) {
    println!("{SEPARATOR}");
    println!("  Partitions:        {}", status.partitions.join(", "));
    println!(
        "  Manifest:          {}",
        if status.manifest_current {
            style("current").green()
        } else {
            style("stale or missing").yellow()
        }
    );
    println!("  Cached:            {}", status.cached);
    println!("  Missing:           {}", status.missing.len());
    if status.staged > 0 {
        println!("  Staged:            {} (run `activate`)", status.staged);
    }
    println!("{SEPARATOR}");
    for key in &status.missing {
        println!("  - {key}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
        assert_eq!(format_bytes(5 * 1_073_741_824 * 1024), "5120.00 GB");
    }

    #[test]
    fn format_elapsed_units() {
        assert_eq!(format_elapsed(Duration::from_millis(42)), "42ms");
        assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "1m 05s");
    }

    #[test]
    fn bar_progress_counts_fetches() {
        let progress = BarProgress::new();
        progress.on_start(2);
        progress.on_fetched("https://a/x.js", 10);
        assert_eq!(progress.bar.position(), 1);
        assert_eq!(progress.bar.length(), Some(2));
        progress.finish();
    }
}
