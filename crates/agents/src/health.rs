//! Service health derived from the rate of degraded findings.

use rust_decimal::Decimal;
use steth_monitor_heuristics::{EventRecord, Finding, RollingWindow};

/// Default look-back for counting degraded findings.
pub const BORDER_TIME_SECS: u64 = 20 * 60;
/// Default number of degraded findings that makes the service unhealthy.
pub const MAX_ERRORS: usize = 25;

/// Counts degraded findings over a rolling window.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    errors: RollingWindow,
    max_errors: usize,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(BORDER_TIME_SECS, MAX_ERRORS)
    }
}

impl HealthChecker {
    pub fn new(border_time_secs: u64, max_errors: usize) -> Self {
        Self {
            errors: RollingWindow::new(border_time_secs),
            max_errors,
        }
    }

    /// Record the degraded findings of one tick.
    ///
    /// # Arguments
    /// * `findings` - Everything the agents emitted for the tick
    /// * `now` - Unix seconds of the tick
    ///
    /// # Returns
    /// Number of degraded findings in the current window.
    pub fn observe(&mut self, findings: &[Finding], now: u64) -> usize {
        let degraded = findings.iter().filter(|f| f.is_degraded()).count() as u64;
        self.errors.extend((0..degraded).map(|index| EventRecord {
            time: now,
            amount: Decimal::ONE,
            block_number: 0,
            log_index: index,
        }));
        self.errors.prune(now);
        self.errors.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_healthy(&self) -> bool {
        self.errors.len() < self.max_errors
    }
}
