//! Transfer progress display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Block-level progress of one transfer
pub struct TransferProgress {
    bar: ProgressBar,
    block_size: u64,
}

impl TransferProgress {
    /// Create a tracker for a transfer of `total_bytes`, or a spinner when
    /// the size is unknown (fetching a remote file)
    #[must_use]
    pub fn new(total_bytes: Option<u64>, block_size: u32, filename: &str) -> Self {
        let bar = match total_bytes {
            Some(total) => {
                let bar = ProgressBar::new(total);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                ) {
                    bar.set_style(style.progress_chars("#>-"));
                }
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                if let Ok(style) =
                    ProgressStyle::default_spinner().template("{spinner:.green} {msg} {bytes}")
                {
                    bar.set_style(style);
                }
                bar.enable_steady_tick(Duration::from_millis(120));
                bar
            }
        };
        bar.set_message(format!("Transferring: {filename}"));

        Self {
            bar,
            block_size: u64::from(block_size),
        }
    }

    /// Update from the committed block count
    pub fn update_rank(&self, rank: u64) {
        let bytes = rank.saturating_mul(self.block_size);
        match self.bar.length() {
            Some(total) => self.bar.set_position(bytes.min(total)),
            None => self.bar.set_position(bytes),
        }
    }

    /// Finish with success message
    pub fn finish(&self, msg: String) {
        if let Some(total) = self.bar.length() {
            self.bar.set_position(total);
        }
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self, msg: String) {
        self.bar.abandon_with_message(msg);
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

/// Format the elapsed time of a record, given start and stop in epoch millis
#[must_use]
pub fn format_elapsed(start_ms: u64, stop_ms: Option<u64>) -> String {
    let Some(stop) = stop_ms else {
        return "-".to_string();
    };
    let secs = stop.saturating_sub(start_ms) / 1000;

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(1_000, None), "-");
        assert_eq!(format_elapsed(1_000, Some(31_000)), "30s");
        assert_eq!(format_elapsed(0, Some(90_000)), "1m 30s");
        assert_eq!(format_elapsed(0, Some(3_661_000)), "1h 1m");
        // Clock went backwards
        assert_eq!(format_elapsed(5_000, Some(1_000)), "0s");
    }

    #[test]
    fn test_update_rank_clamps_to_total() {
        let progress = TransferProgress::new(Some(10_000), 4096, "f.bin");
        progress.update_rank(3);
        assert_eq!(progress.bar.position(), 10_000);
        progress.update_rank(1);
        assert_eq!(progress.bar.position(), 4096);
    }
}
