//! Ranking timing and outcome instrumentation

use serde::Serialize;
use std::time::Instant;

/// Summary of one ranking request, logged at debug level
#[derive(Debug, Clone, Default, Serialize)]
pub struct RankingMetrics {
    pub user_id: String,
    pub history_size: usize,
    pub affinity_categories: usize,
    pub candidates_considered: usize,
    pub excluded_read: usize,
    pub failed_branches: usize,
    pub returned: usize,
    pub duration_ms: u64,
}

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: &'static str,
    histogram: Option<&'static str>,
}

impl PerformanceTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
            histogram: None,
        }
    }

    /// Also record the elapsed milliseconds into `histogram` on drop
    pub fn recorded(label: &'static str, histogram: &'static str) -> Self {
        Self {
            histogram: Some(histogram),
            ..Self::new(label)
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        if let Some(name) = self.histogram {
            metrics::histogram!(name).record(elapsed as f64);
        }
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
    }
}
