//! Findings emitted by the agents and the degraded-source error that turns
//! into one.

use alloy::primitives::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Alert id shared by every degraded-source finding.
pub const NETWORK_ERROR_ALERT_ID: &str = "NETWORK-ERROR";

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Reserved for degraded findings.
    Unknown,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindingType {
    Unknown,
    Info,
    Suspicious,
    Degraded,
}

/// A structured alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub alert_id: String,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub finding_type: FindingType,
    pub unique_key: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Finding {
    pub fn new(
        alert_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        finding_type: FindingType,
    ) -> Self {
        Self {
            alert_id: alert_id.into(),
            name: name.into(),
            description: description.into(),
            severity,
            finding_type,
            unique_key: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_unique_key(mut self, key: String) -> Self {
        self.unique_key = Some(key);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.alert_id == NETWORK_ERROR_ALERT_ID
    }
}

/// Code location of a failing collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTag {
    pub component: &'static str,
    pub operation: &'static str,
    pub line: u32,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.component, self.operation, self.line)
    }
}

/// Capture a [`SourceTag`] for the current line.
#[macro_export]
macro_rules! source_tag {
    ($component:expr, $operation:expr) => {
        $crate::finding::SourceTag {
            component: $component,
            operation: $operation,
            line: line!(),
        }
    };
}

/// A collaborator (RPC node, repository) failed for this invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Error in {origin}: could not call {call}: {reason}")]
pub struct SourceUnavailable {
    pub origin: SourceTag,
    pub call: String,
    pub reason: String,
    pub block_number: Option<u64>,
}

impl SourceUnavailable {
    pub fn new(origin: SourceTag, call: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            origin,
            call: call.into(),
            reason: reason.to_string(),
            block_number: None,
        }
    }

    pub fn at_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    /// Convert into the degraded finding reported to the sink.
    pub fn to_finding(&self) -> Finding {
        let discriminator = format!("{}-{}", self.call, self.block_number.unwrap_or_default());
        let mut finding = Finding::new(
            NETWORK_ERROR_ALERT_ID,
            format!("Error in {}", self.origin),
            format!("Could not call {}", self.call),
            Severity::Unknown,
            FindingType::Degraded,
        )
        .with_unique_key(unique_key(&self.origin.to_string(), discriminator))
        .with_metadata("error", &self.reason);
        if let Some(block) = self.block_number {
            finding = finding.with_metadata("block", block);
        }
        finding
    }
}

/// Deterministic, UUID-shaped key for a logical alert occurrence.
///
/// # Arguments
/// * `seed` - Per-alert-family seed
/// * `discriminator` - What makes this occurrence distinct (block number, ids)
///
/// # Returns
/// The same key for the same inputs, across processes.
pub fn unique_key(seed: &str, discriminator: impl fmt::Display) -> String {
    let hash = keccak256(format!("{}-{}", seed, discriminator).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    Uuid::from_bytes(bytes).to_string()
}
