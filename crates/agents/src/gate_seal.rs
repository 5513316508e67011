//! GateSeal monitoring: expiry, pause roles on the sealables, and the
//! seal and factory events.

use crate::config::GateSealConfig;
use crate::events::{apply_rules, EventRule, GateSealCreated, Sealed};
use crate::{collect, Agent};
use alloy::primitives::{keccak256, Address, B256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use steth_monitor_heuristics::decoder::decode_log;
use steth_monitor_heuristics::format::{etherscan_address, fmt_duration, fmt_gmt};
use steth_monitor_heuristics::{
    source_tag, AlertKey, AlertLimiter, Comparison, Finding, FindingType, Severity, SourceUnavailable, TieredThreshold,
};
use steth_monitor_provider::{BlockRef, ChainLog, ChainProvider, ContractCall, TransactionEvent};
use tracing::{debug, warn};

const COMPONENT: &str = "GateSealAgent";

const GET_EXPIRY_TIMESTAMP: &str = "get_expiry_timestamp()";
const HAS_ROLE: &str = "hasRole(bytes32,address)";

const MISSING_PAUSE_ROLE_ALERT_ID: &str = "GATE-SEAL-MISSING-PAUSE-ROLE";

fn pause_role() -> B256 {
    keccak256("PAUSE_ROLE")
}

fn describe_created(log: &ChainLog) -> Option<String> {
    let event = decode_log::<GateSealCreated>(log).ok()?;
    Some(format!(
        "New instance address: {}\ndev: Please, check if `GATE_SEAL_DEFAULT_ADDRESS` should be updated in the nearest future",
        etherscan_address(event.gate_seal)
    ))
}

fn describe_sealed(log: &ChainLog) -> Option<String> {
    let event = decode_log::<Sealed>(log).ok()?;
    let sealed_for = u64::try_from(event.sealed_for).ok()?;
    let sealed_until = u64::try_from(event.sealed_until).ok()?;
    Some(format!(
        "GateSeal address: {}\nSealed by: {}\nSealed for: {}\nSealable: {}\nSealed until: {}",
        etherscan_address(event.gate_seal),
        etherscan_address(event.sealed_by),
        fmt_duration(sealed_for),
        etherscan_address(event.sealable),
        fmt_gmt(sealed_until)
    ))
}

fn event_rules(config: &GateSealConfig) -> Vec<EventRule> {
    vec![
        EventRule {
            address: config.gate_seal_factory,
            topic: GateSealCreated::SIGNATURE_HASH,
            alert_id: "GATE-SEAL-NEW-ONE-CREATED",
            name: "🥳 GateSeal: New one created",
            severity: Severity::Medium,
            finding_type: FindingType::Info,
            describe: describe_created,
        },
        EventRule {
            address: config.gate_seal,
            topic: Sealed::SIGNATURE_HASH,
            alert_id: "GATE-SEAL-TRIGGERED",
            name: "🚨🚨🚨 GateSeal: is triggered",
            severity: Severity::Critical,
            finding_type: FindingType::Info,
            describe: describe_sealed,
        },
    ]
}

/// Watches one GateSeal instance and its factory.
pub struct GateSealAgent {
    provider: Arc<dyn ChainProvider>,
    config: GateSealConfig,
    rules: Vec<EventRule>,
    expiry: TieredThreshold,
    limiter: AlertLimiter,
}

impl GateSealAgent {
    pub fn new(provider: Arc<dyn ChainProvider>, config: GateSealConfig) -> Self {
        Self {
            provider,
            rules: event_rules(&config),
            expiry: TieredThreshold::new(Comparison::Below, config.expiry.clone()),
            config,
            limiter: AlertLimiter::new(),
        }
    }

    async fn handle_expiry(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let gate_seal = self.config.gate_seal;
        let expiry = self
            .provider
            .get_contract_scalar(gate_seal, &ContractCall::new(GET_EXPIRY_TIMESTAMP), block.number)
            .await
            .map_err(|e| {
                SourceUnavailable::new(
                    source_tag!(COMPONENT, "handle_expiry"),
                    format!("provider.{}", GET_EXPIRY_TIMESTAMP),
                    e,
                )
                .at_block(block.number)
            })?;

        let expiry = u64::try_from(expiry).unwrap_or(u64::MAX);
        let remaining = Decimal::from(expiry) - Decimal::from(block.timestamp);
        let Some(tier) = self.expiry.evaluate(remaining) else {
            return Ok(Vec::new());
        };
        let key = AlertKey::with_sub_id(tier.alert_id.clone(), gate_seal);
        if !self.limiter.try_acquire(&key, block.timestamp, tier.cooldown_secs) {
            return Ok(Vec::new());
        }

        let name = if tier.threshold <= Decimal::ZERO {
            "🚨 GateSeal: is expired!"
        } else {
            "⚠️ GateSeal: is about to be expired"
        };
        let expiry_date = fmt_gmt(expiry);
        Ok(vec![Finding::new(
            tier.alert_id.clone(),
            name,
            format!(
                "GateSeal address: {}\nExpiry date {}",
                etherscan_address(gate_seal),
                expiry_date
            ),
            tier.severity,
            FindingType::Degraded,
        )])
    }

    /// The GateSeal must hold `PAUSE_ROLE` on every sealable.
    async fn handle_pause_roles(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let gate_seal = self.config.gate_seal;
        let sealables = [
            ("WithdrawalQueue", self.config.withdrawal_queue),
            ("ValidatorsExitBusOracle", self.config.exit_bus_oracle),
        ];

        let mut missing = Vec::new();
        for (name, sealable) in sealables {
            let call = ContractCall::new(HAS_ROLE).arg_word(pause_role()).arg_address(gate_seal);
            let has_role = self
                .provider
                .get_contract_scalar(sealable, &call, block.number)
                .await
                .map_err(|e| {
                    SourceUnavailable::new(
                        source_tag!(COMPONENT, "handle_pause_roles"),
                        format!("provider.{} on {}", HAS_ROLE, name),
                        e,
                    )
                    .at_block(block.number)
                })?;
            if has_role.is_zero() {
                warn!("GateSeal {} has no PAUSE_ROLE on {}", gate_seal, name);
                missing.push(format!("{} {}", name, etherscan_address(sealable)));
            }
        }
        if missing.is_empty() {
            debug!("GateSeal {} holds every pause role", gate_seal);
            return Ok(Vec::new());
        }

        let key = AlertKey::with_sub_id(MISSING_PAUSE_ROLE_ALERT_ID, gate_seal);
        if !self
            .limiter
            .try_acquire(&key, block.timestamp, self.config.pause_role_cooldown_secs)
        {
            return Ok(Vec::new());
        }
        Ok(vec![Finding::new(
            MISSING_PAUSE_ROLE_ALERT_ID,
            "⚠️ GateSeal: actual address doesn't have PAUSE_ROLE for contracts",
            format!(
                "GateSeal address: {}\nContracts without PAUSE_ROLE:\n{}",
                etherscan_address(gate_seal),
                missing.join("\n")
            ),
            Severity::High,
            FindingType::Degraded,
        )])
    }
}

#[async_trait]
impl Agent for GateSealAgent {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn watched_addresses(&self) -> Vec<Address> {
        vec![self.config.gate_seal, self.config.gate_seal_factory]
    }

    async fn handle_block(&mut self, block: &BlockRef) -> Vec<Finding> {
        let mut findings = Vec::new();
        collect(&mut findings, self.handle_expiry(block).await);
        collect(&mut findings, self.handle_pause_roles(block).await);
        findings
    }

    async fn handle_transaction(&mut self, tx: &TransactionEvent) -> Vec<Finding> {
        apply_rules(&self.rules, tx)
    }
}
