//! Monitoring agents.
//!
//! Each agent watches one concern of the staking protocol, keeps its own
//! state, and turns blocks and transactions into findings. Collaborator
//! failures never abort an agent; they are reported as degraded findings.

pub mod bridge;
pub mod config;
pub mod events;
pub mod gate_seal;
pub mod health;
pub mod steth_operation;
pub mod withdrawals;

pub use bridge::BridgeAgent;
pub use config::{AgentsConfig, ConfigError};
pub use gate_seal::GateSealAgent;
pub use health::HealthChecker;
pub use steth_operation::StethOperationAgent;
pub use withdrawals::WithdrawalsAgent;

use alloy::primitives::Address;
use async_trait::async_trait;
use steth_monitor_heuristics::{Finding, SourceUnavailable};
use steth_monitor_provider::{BlockRef, TransactionEvent};

/// A stateful monitor driven by the block loop.
///
/// For every block the loop first hands over the block's transactions in
/// order, then the block itself.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &'static str;

    /// Contracts whose logs this agent needs in [`Agent::handle_transaction`].
    fn watched_addresses(&self) -> Vec<Address>;

    /// Load the state the agent needs before the first block.
    ///
    /// Each piece of state is loaded on its own; a piece that cannot be
    /// loaded is left unset and reported, and the agent still runs.
    ///
    /// # Arguments
    /// * `start_block` - Head block the loop will process first
    ///
    /// # Returns
    /// One degraded finding per failed load.
    async fn initialize(&mut self, _start_block: &BlockRef) -> Vec<Finding> {
        Vec::new()
    }

    async fn handle_block(&mut self, block: &BlockRef) -> Vec<Finding>;

    async fn handle_transaction(&mut self, tx: &TransactionEvent) -> Vec<Finding>;
}

/// Append a check's findings, or its degraded finding on failure.
pub(crate) fn collect(findings: &mut Vec<Finding>, result: Result<Vec<Finding>, SourceUnavailable>) {
    if let Some(found) = or_degraded(result, findings) {
        findings.extend(found);
    }
}

/// Unwrap a collaborator result, reporting the error as a degraded finding.
pub(crate) fn or_degraded<T>(result: Result<T, SourceUnavailable>, findings: &mut Vec<Finding>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            degrade(e, findings);
            None
        }
    }
}

pub(crate) fn degrade(e: SourceUnavailable, findings: &mut Vec<Finding>) {
    tracing::warn!("{}", e);
    findings.push(e.to_finding());
}
