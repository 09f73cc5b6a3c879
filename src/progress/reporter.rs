//! Progress reporter implementation
//!
//! Renders successive [`JobStatus`] snapshots with indicatif:
//! - File count progress
//! - Byte transfer progress
//! - Throughput and error count

use crate::mirror::JobStatus;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Progress bars for one mirror job
pub struct ProgressReporter {
    /// Multi-progress container
    multi: MultiProgress,
    /// Byte progress of copied tasks
    bytes_bar: ProgressBar,
    /// Finished task count
    files_bar: ProgressBar,
    /// Current status message
    status: ProgressBar,
    /// Start time
    start_time: Instant,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        // Status line
        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        status.enable_steady_tick(Duration::from_millis(120));

        let files_bar = multi.add(ProgressBar::new(0));
        files_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} files ({percent}%)",
        ));
        files_bar.set_prefix("Files");

        let bytes_bar = multi.add(ProgressBar::new(0));
        bytes_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
        ));
        bytes_bar.set_prefix("Data ");

        Self {
            multi,
            bytes_bar,
            files_bar,
            status,
            start_time: Instant::now(),
        }
    }

    /// Create a disabled progress reporter (for quiet mode)
    pub fn disabled() -> Self {
        let reporter = Self::new();
        reporter.status.disable_steady_tick();
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Show the latest snapshot
    pub fn update(&self, status: &JobStatus) {
        self.files_bar.set_length(status.total as u64);
        self.files_bar
            .set_position((status.transferred + status.errored) as u64);
        self.bytes_bar.set_length(status.bytes_total);
        self.bytes_bar.set_position(status.bytes_transferred);
        self.status.set_message(status_line(status));
    }

    /// Freeze the bars on the final snapshot
    pub fn finish(&self, status: &JobStatus) {
        self.update(status);
        if status.has_errors() {
            self.status.finish_with_message(format!(
                "✗ {} of {} files failed",
                status.errored, status.total
            ));
            self.files_bar.abandon();
            self.bytes_bar.abandon();
        } else {
            self.status
                .finish_with_message(format!("✓ {} files mirrored", status.transferred));
            self.files_bar.finish();
            self.bytes_bar.finish();
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Summary of a snapshot, timed from this reporter's creation
    pub fn summary(&self, status: &JobStatus) -> ProgressSummary {
        ProgressSummary::new(status, self.elapsed())
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn status_line(status: &JobStatus) -> String {
    let mut line = format!(
        "{} running, {} pending",
        status.running, status.pending
    );
    if status.errored > 0 {
        line.push_str(&format!(", {} errors", status.errored));
    }
    if !status.skipped.is_empty() {
        line.push_str(&format!(", {} skipped", status.skipped.len()));
    }
    line
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    /// Total bytes to transfer
    pub total_bytes: u64,
    /// Bytes copied so far
    pub bytes_copied: u64,
    /// Total files to transfer
    pub total_files: usize,
    /// Files copied so far
    pub files_copied: usize,
    /// Files failed or cancelled
    pub files_errored: usize,
    /// Files skipped as already present
    pub files_skipped: usize,
    /// Elapsed time
    pub elapsed: Duration,
    /// Throughput in bytes/second
    pub throughput: f64,
}

impl ProgressSummary {
    /// Summarize a snapshot
    pub fn new(status: &JobStatus, elapsed: Duration) -> Self {
        Self {
            total_bytes: status.bytes_total,
            bytes_copied: status.bytes_transferred,
            total_files: status.total,
            files_copied: status.transferred,
            files_errored: status.errored,
            files_skipped: status.skipped.len(),
            elapsed,
            throughput: status.throughput_bytes_per_sec,
        }
    }

    /// Get completion percentage
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_files == 0 {
                100.0
            } else {
                (self.files_copied as f64 / self.total_files as f64) * 100.0
            }
        } else {
            (self.bytes_copied as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Print summary to console
    pub fn print(&self) {
        println!("Progress: {:.1}%", self.percentage());
        println!("Files:    {}/{}", self.files_copied, self.total_files);
        if self.files_skipped > 0 {
            println!("Skipped:  {}", self.files_skipped);
        }
        if self.files_errored > 0 {
            println!("Errors:   {}", self.files_errored);
        }
        println!("Bytes:    {}/{}",
            humansize::format_size(self.bytes_copied, humansize::BINARY),
            humansize::format_size(self.total_bytes, humansize::BINARY)
        );
        println!("Elapsed:  {}", humantime::format_duration(Duration::from_secs(self.elapsed.as_secs())));
        println!("Speed:    {}/s", humansize::format_size(self.throughput as u64, humansize::BINARY));
    }
}

/// Simple text-based progress for non-TTY environments
pub struct SimpleProgress {
    /// Start time
    start_time: Instant,
    /// Last report time
    last_report: AtomicU64,
    /// Report interval in milliseconds
    report_interval_ms: u64,
}

impl SimpleProgress {
    /// Create a new simple progress reporter
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_report: AtomicU64::new(0),
            report_interval_ms: 5000,
        }
    }

    /// Print the snapshot if the report interval has passed
    pub fn update(&self, status: &JobStatus) {
        let elapsed_ms = self.start_time.elapsed().as_millis() as u64;
        let last = self.last_report.load(Ordering::Relaxed);

        if elapsed_ms.saturating_sub(last) >= self.report_interval_ms {
            self.last_report.store(elapsed_ms, Ordering::Relaxed);
            println!("{}", progress_line(status));
        }
    }

    /// Print the final snapshot
    pub fn finish(&self, status: &JobStatus) {
        println!(
            "Completed: {}/{} files, {} errors, {} in {}",
            status.transferred,
            status.total,
            status.errored,
            humansize::format_size(status.bytes_transferred, humansize::BINARY),
            humantime::format_duration(Duration::from_secs(self.start_time.elapsed().as_secs()))
        );
    }
}

impl Default for SimpleProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line rendering of a snapshot
pub fn progress_line(status: &JobStatus) -> String {
    let summary = ProgressSummary::new(status, Duration::ZERO);
    format!(
        "[{:.1}%] {}/{} files, {}/{} @ {}/s",
        summary.percentage(),
        status.transferred,
        status.total,
        humansize::format_size(status.bytes_transferred, humansize::BINARY),
        humansize::format_size(status.bytes_total, humansize::BINARY),
        humansize::format_size(status.throughput_bytes_per_sec as u64, humansize::BINARY)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::JobHandle;
    use crate::storage::StorageLocation;
    use chrono::Utc;

    fn snapshot(transferred: usize, bytes: u64) -> JobStatus {
        JobStatus {
            job: JobHandle::from_string("j"),
            source: StorageLocation::new("s", ""),
            destination: StorageLocation::new("d", ""),
            created_at: Utc::now(),
            total: 4,
            transferred,
            errored: 0,
            cancelled: 0,
            pending: 4 - transferred,
            running: 0,
            complete: transferred == 4,
            bytes_total: 1000,
            bytes_transferred: bytes,
            started_at: None,
            ended_at: None,
            throughput_bytes_per_sec: 0.0,
            errors: Vec::new(),
            skipped: vec!["x".to_string()],
            filewise: Vec::new(),
        }
    }

    #[test]
    fn test_progress_reporter() {
        let reporter = ProgressReporter::disabled();
        let status = snapshot(2, 500);
        reporter.update(&status);

        let summary = reporter.summary(&status);
        assert_eq!(summary.bytes_copied, 500);
        assert_eq!(summary.files_copied, 2);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.percentage(), 50.0);

        reporter.finish(&snapshot(4, 1000));
    }

    #[test]
    fn test_empty_job_is_complete() {
        let mut status = snapshot(0, 0);
        status.total = 0;
        status.bytes_total = 0;
        assert_eq!(ProgressSummary::new(&status, Duration::ZERO).percentage(), 100.0);
    }

    #[test]
    fn test_progress_line() {
        let line = progress_line(&snapshot(1, 250));
        assert!(line.starts_with("[25.0%] 1/4 files"));
    }
}
