use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// A snapshot of a transfer's progress, reported whenever sent / received / total counts change
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ProgressStats {
    pub bytes_sent: u64,
    pub bytes_confirmed_received: u64,
    /// `None` while the size of the resource is not known
    pub total_size_bytes: Option<u64>,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressStats) + Send + Sync>;

impl ProgressStats {
    pub fn new(bytes_sent: u64, bytes_confirmed_received: u64, total_size_bytes: Option<u64>) -> ProgressStats {
        ProgressStats {
            bytes_sent,
            bytes_confirmed_received,
            total_size_bytes,
        }
    }

    /// NaN if the total size is unknown or zero
    pub fn percent_received(&self) -> f64 {
        match self.total_size_bytes {
            None | Some(0) => f64::NAN,
            Some(total) => self.bytes_confirmed_received as f64 / total as f64 * 100.0,
        }
    }
}

impl Display for ProgressStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let total = self.total_size_bytes
            .map(|t| t.to_string())
            .unwrap_or("unknown".to_string());

        write!(f, "{:5.1}% ({} B sent, {} B received of {} B)", self.percent_received(), self.bytes_sent, self.bytes_confirmed_received, total)
    }
}
