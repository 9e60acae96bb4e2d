//! Transfer progress display with progress bars.

use std::time::Duration;

use demonsaw_core::{Status, TransferJob};
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Transfer progress tracker
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress tracker
    #[must_use]
    pub fn new(total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(format!("Transferring: {filename}"));
        Self { bar }
    }

    /// Redraw `job` until it reaches a final status.
    pub async fn follow(&self, job: &TransferJob) -> Status {
        let transfer = job.transfer();
        loop {
            self.bar.set_position(transfer.size());
            let status = job.status();
            match status {
                Status::Success => {
                    self.bar.finish_with_message(format!(
                        "{} complete ({}/s, {})",
                        job.file_name(),
                        format_bytes(transfer.speed()),
                        transfer.time()
                    ));
                    return status;
                }
                Status::Error | Status::Cancelled => {
                    self.bar.abandon_with_message(format!("{} {:?}", job.file_name(), status));
                    return status;
                }
                _ => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    }
}

/// Format bytes in human-readable format
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(768 * 1024), "768.00 KB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
    }

    #[tokio::test]
    async fn test_follow_finished_job() {
        let job = TransferJob::download("slot", "done.bin", 10);
        job.transfer().update(10);
        job.set_status(Status::Success);
        let progress = TransferProgress::new(10, "done.bin");
        assert_eq!(progress.follow(&job).await, Status::Success);
    }
}
