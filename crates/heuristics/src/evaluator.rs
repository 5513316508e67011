//! Threshold and invariant evaluation.

use crate::finding::Severity;
use bigdecimal::BigDecimal;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One alert tier: fire when the watched value crosses `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub alert_id: String,
    pub threshold: Decimal,
    pub cooldown_secs: u64,
    pub severity: Severity,
}

/// Direction of a threshold crossing. Both are strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    /// `value < threshold`
    Below,
    /// `value > threshold`
    Above,
}

impl Comparison {
    pub fn crosses(&self, value: Decimal, threshold: Decimal) -> bool {
        match self {
            Comparison::Below => value < threshold,
            Comparison::Above => value > threshold,
        }
    }
}

/// Ordered set of tiers for one watched value.
#[derive(Debug, Clone)]
pub struct TieredThreshold {
    comparison: Comparison,
    tiers: Vec<ThresholdConfig>,
}

impl TieredThreshold {
    /// Build a tier set. Tiers are evaluated most severe first; equal
    /// severities keep declaration order.
    pub fn new(comparison: Comparison, mut tiers: Vec<ThresholdConfig>) -> Self {
        tiers.sort_by(|a, b| b.severity.cmp(&a.severity));
        Self { comparison, tiers }
    }

    /// Return the first tier `value` crosses, if any.
    pub fn evaluate(&self, value: Decimal) -> Option<&ThresholdConfig> {
        self.tiers
            .iter()
            .find(|tier| self.comparison.crosses(value, tier.threshold))
    }

    /// Every tier `value` crosses, most severe first. For callers that gate
    /// tiers on extra conditions.
    pub fn crossed(&self, value: Decimal) -> impl Iterator<Item = &ThresholdConfig> + '_ {
        let comparison = self.comparison;
        self.tiers
            .iter()
            .filter(move |tier| comparison.crosses(value, tier.threshold))
    }

    pub fn tiers(&self) -> &[ThresholdConfig] {
        &self.tiers
    }

    pub fn comparison(&self) -> Comparison {
        self.comparison
    }
}

/// A value observed at a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot<T = BigDecimal> {
    pub value: T,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaViolation {
    pub previous: Snapshot,
    pub current: Snapshot,
    /// `current - previous`
    pub diff: BigDecimal,
}

/// Check that a value did not move by more than `epsilon` between snapshots.
///
/// Arithmetic is exact at any magnitude, so a drift of a fraction of a wei
/// on a 1e27-scaled rate is still seen.
///
/// # Arguments
/// * `previous` - Last accepted snapshot; need not be from the preceding block
/// * `current` - Freshly observed snapshot
/// * `epsilon` - Allowed absolute change
///
/// # Returns
/// The violation if `|current - previous| > epsilon`.
pub fn check_delta(previous: &Snapshot, current: &Snapshot, epsilon: &BigDecimal) -> Option<DeltaViolation> {
    let diff = &current.value - &previous.value;
    if diff.abs() > *epsilon {
        Some(DeltaViolation {
            previous: previous.clone(),
            current: current.clone(),
            diff,
        })
    } else {
        None
    }
}
