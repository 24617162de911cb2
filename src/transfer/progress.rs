use std::time::Duration;

/// Snapshot of an in-flight transfer, for display only
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
    /// 0.0 to 1.0; 0.0 while the total is unknown
    pub fraction: f64,
    pub bytes_per_second: f64,
    pub eta: Duration,
}

impl DownloadProgress {
    /// Derive fraction, average throughput and ETA from raw counters
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(bytes_written: u64, bytes_expected: Option<u64>, elapsed: Duration) -> Self {
        let expected = bytes_expected.filter(|total| *total > 0);

        let fraction = expected.map_or(0.0, |total| {
            (bytes_written as f64 / total as f64).clamp(0.0, 1.0)
        });

        let elapsed_secs = elapsed.as_secs_f64();
        let bytes_per_second = if elapsed_secs > 0.0 {
            bytes_written as f64 / elapsed_secs
        } else {
            0.0
        };

        let eta = match expected {
            Some(total) if bytes_per_second > 0.0 => {
                let remaining = total.saturating_sub(bytes_written) as f64;
                Duration::try_from_secs_f64(remaining / bytes_per_second).unwrap_or(Duration::ZERO)
            }
            _ => Duration::ZERO,
        };

        Self {
            bytes_written,
            bytes_expected,
            fraction,
            bytes_per_second,
            eta,
        }
    }
}

/// Notifications emitted by the transfer engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(DownloadProgress),
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
