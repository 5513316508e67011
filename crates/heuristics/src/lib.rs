//! Detection building blocks shared by every monitoring agent.
//!
//! Decoding of raw logs, rolling windows over recent events, tiered
//! thresholds and invariant checks, alert rate limiting, and the
//! [`Finding`] type agents emit.

pub mod cooldown;
pub mod decoder;
pub mod evaluator;
pub mod finding;
pub mod format;
pub mod window;

pub use cooldown::{AlertKey, AlertLimiter};
pub use decoder::{filter_logs, DecodedEvent};
pub use evaluator::{check_delta, Comparison, Snapshot, ThresholdConfig, TieredThreshold};
pub use finding::{unique_key, Finding, FindingType, Severity, SourceTag, SourceUnavailable};
pub use window::{Aggregate, EventRecord, RollingWindow};
