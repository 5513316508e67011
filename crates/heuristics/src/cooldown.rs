//! Per-alert emission rate limiting.

use std::collections::HashMap;

/// Identity of a logical alert. `sub_id` separates independent instances of
/// the same alert id (tiers, contracts, request ids).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub alert_id: String,
    pub sub_id: Option<String>,
}

impl AlertKey {
    pub fn new(alert_id: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.into(),
            sub_id: None,
        }
    }

    pub fn with_sub_id(alert_id: impl Into<String>, sub_id: impl ToString) -> Self {
        Self {
            alert_id: alert_id.into(),
            sub_id: Some(sub_id.to_string()),
        }
    }
}

/// Remembers when each alert was last emitted.
#[derive(Debug, Default, Clone)]
pub struct AlertLimiter {
    last_reported: HashMap<AlertKey, u64>,
}

impl AlertLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an alert may fire at `now`: never reported, or the cooldown
    /// has fully elapsed.
    pub fn should_emit(&self, key: &AlertKey, now: u64, cooldown_secs: u64) -> bool {
        match self.last_reported.get(key) {
            None => true,
            Some(last) => now.saturating_sub(*last) >= cooldown_secs,
        }
    }

    pub fn record(&mut self, key: AlertKey, now: u64) {
        self.last_reported.insert(key, now);
    }

    /// Check and record in one step.
    ///
    /// # Returns
    /// `true` if the caller should emit the finding.
    pub fn try_acquire(&mut self, key: &AlertKey, now: u64, cooldown_secs: u64) -> bool {
        if self.should_emit(key, now, cooldown_secs) {
            self.record(key.clone(), now);
            true
        } else {
            false
        }
    }

    pub fn last_reported(&self, key: &AlertKey) -> Option<u64> {
        self.last_reported.get(key).copied()
    }

    /// Seed a last-report time, e.g. restored at startup.
    pub fn set_last_reported(&mut self, key: AlertKey, time: u64) {
        self.last_reported.insert(key, time);
    }
}

/// A cooldown never outlasts the window the alert aggregates over.
pub fn effective_cooldown(cooldown_secs: u64, window_secs: u64) -> u64 {
    cooldown_secs.min(window_secs)
}
