//! L2 bridge monitoring.
//!
//! Follows the L2 chain alongside L1: withdrawals initiated on L2 are summed
//! over a rolling window, and the bridged wstETH supply on L2 is checked
//! against the L1 bridge balance for every new L2 block.

use crate::config::BridgeConfig;
use crate::events::{
    apply_rules, role_name, BridgingInitiated, DepositsDisabled, DepositsEnabled, EventRule, RoleGranted, RoleRevoked,
    WithdrawalInitiated, WithdrawalsDisabled, WithdrawalsEnabled,
};
use crate::{collect, or_degraded, Agent};
use alloy::primitives::{Address, B256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use steth_monitor_heuristics::cooldown::effective_cooldown;
use steth_monitor_heuristics::decoder::decode_log;
use steth_monitor_heuristics::format::{etherscan_address, fmt_fixed, fmt_wei, to_ether};
use steth_monitor_heuristics::{
    filter_logs, source_tag, unique_key, AlertKey, AlertLimiter, EventRecord, Finding, FindingType, RollingWindow,
    Severity, SourceUnavailable, ThresholdConfig,
};
use steth_monitor_ingestion::BlockReconciler;
use steth_monitor_provider::{u256_to_decimal, BlockRef, ChainLog, ChainProvider, ContractCall, TransactionEvent};
use tracing::{debug, info, warn};

const COMPONENT: &str = "BridgeAgent";

const BALANCE_OF: &str = "balanceOf(address)";
const TOTAL_SUPPLY: &str = "totalSupply()";

const HUGE_WITHDRAWALS_SEED: &str = "0df95654-ecbb-4f63-a5c0-a9d584365511";
const BALANCE_MISMATCH_SEED: &str = "ac6b4e21-9f3f-4434-ab7a-52a0d98624d3";

/// wstETH withdrawals initiated on L2, as window records.
///
/// # Arguments
/// * `logs` - L2 logs of the token bridge
/// * `blocks` - Blocks the logs belong to; logs of other blocks are skipped
/// * `config` - Bridge and token addresses
pub fn withdrawal_records(logs: &[ChainLog], blocks: &[BlockRef], config: &BridgeConfig) -> Vec<EventRecord> {
    let timestamps: HashMap<u64, u64> = blocks.iter().map(|b| (b.number, b.timestamp)).collect();
    let bridge = config.l2_token_bridge;
    let token = config.l2_wsteth;

    let bridging = filter_logs::<BridgingInitiated>(logs, bridge)
        .into_iter()
        .filter(|decoded| decoded.event.token == token)
        .map(|decoded| (decoded.block_number, decoded.log_index, decoded.event.amount));
    let initiated = filter_logs::<WithdrawalInitiated>(logs, bridge)
        .into_iter()
        .filter(|decoded| decoded.event._l2Token == token)
        .map(|decoded| (decoded.block_number, decoded.log_index, decoded.event._amount));

    bridging
        .chain(initiated)
        .filter_map(|(block_number, log_index, amount)| {
            let Some(time) = timestamps.get(&block_number).copied() else {
                debug!("Skipping withdrawal in unknown L2 block {}", block_number);
                return None;
            };
            match u256_to_decimal(amount) {
                Ok(amount) => Some(EventRecord {
                    time,
                    amount,
                    block_number,
                    log_index,
                }),
                Err(e) => {
                    warn!("Skipping withdrawal at L2 block {}: {}", block_number, e);
                    None
                }
            }
        })
        .collect()
}

/// Sums L2 withdrawals over a rolling window and reports huge totals.
pub struct WithdrawalsWindowMonitor {
    window: RollingWindow,
    tier: ThresholdConfig,
    report_every_blocks: u64,
    network_name: String,
    limiter: AlertLimiter,
}

impl WithdrawalsWindowMonitor {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            window: RollingWindow::new(config.withdrawals_window_secs),
            tier: config.huge_withdrawals.clone(),
            report_every_blocks: config.report_every_blocks.max(1),
            network_name: config.network_name.clone(),
            limiter: AlertLimiter::new(),
        }
    }

    pub fn record(&mut self, records: impl IntoIterator<Item = EventRecord>) {
        self.window.extend(records);
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    /// Prune the window at `block` and report if the total is huge.
    ///
    /// Only withdrawals dated up to `block` are summed, so records of later
    /// blocks of the same batch wait for their own block.
    ///
    /// # Returns
    /// A finding when the sum reaches the threshold on a reporting block and
    /// the cooldown allows it. Reported records are dropped.
    pub fn evaluate(&mut self, block: &BlockRef) -> Option<Finding> {
        let now = block.timestamp;
        self.window.prune(now);
        if block.number % self.report_every_blocks != 0 {
            return None;
        }

        let total = to_ether(self.window.aggregate_until(now).sum);
        if total < self.tier.threshold {
            return None;
        }

        let window_secs = self.window.window_secs();
        let key = AlertKey::new(self.tier.alert_id.clone());
        let period = self
            .limiter
            .last_reported(&key)
            .map_or(window_secs, |last| now.saturating_sub(last).min(window_secs));
        if !self
            .limiter
            .try_acquire(&key, now, effective_cooldown(self.tier.cooldown_secs, window_secs))
        {
            return None;
        }

        let dropped = self.window.retain_after(now);
        info!(
            "Reported {} wstETH of {} withdrawals at L2 block {}, dropped {} records",
            total, self.network_name, block.number, dropped
        );
        Some(
            Finding::new(
                self.tier.alert_id.clone(),
                format!(
                    "⚠️ {}: Huge withdrawals during the last {} hour(s)",
                    self.network_name,
                    period / 3_600
                ),
                format!(
                    "There were withdrawals requests from L2 to L1 for the {} wstETH in total",
                    fmt_fixed(total, 4)
                ),
                self.tier.severity,
                FindingType::Suspicious,
            )
            .with_unique_key(unique_key(HUGE_WITHDRAWALS_SEED, block.number))
            .with_metadata("l2_block", block.number),
        )
    }
}

fn describe_deposits_enabled(log: &ChainLog) -> Option<String> {
    let event = decode_log::<DepositsEnabled>(log).ok()?;
    Some(format!(
        "Deposits were enabled by {}\n\nBlockNumber {}",
        etherscan_address(event.enabler),
        log.block_number
    ))
}

fn describe_deposits_disabled(log: &ChainLog) -> Option<String> {
    let event = decode_log::<DepositsDisabled>(log).ok()?;
    Some(format!(
        "Deposits were disabled by {}\n\nBlockNumber {}",
        etherscan_address(event.disabler),
        log.block_number
    ))
}

fn describe_withdrawals_enabled(log: &ChainLog) -> Option<String> {
    let event = decode_log::<WithdrawalsEnabled>(log).ok()?;
    Some(format!(
        "Withdrawals were enabled by {}\n\nBlockNumber {}",
        etherscan_address(event.enabler),
        log.block_number
    ))
}

fn describe_withdrawals_disabled(log: &ChainLog) -> Option<String> {
    let event = decode_log::<WithdrawalsDisabled>(log).ok()?;
    Some(format!(
        "Withdrawals were disabled by {}\n\nBlockNumber {}",
        etherscan_address(event.disabler),
        log.block_number
    ))
}

fn describe_role_granted(log: &ChainLog) -> Option<String> {
    let event = decode_log::<RoleGranted>(log).ok()?;
    Some(format!(
        "Role {} was granted to {} by {}\n\nBlockNumber {}",
        role_name(event.role),
        etherscan_address(event.account),
        etherscan_address(event.sender),
        log.block_number
    ))
}

fn describe_role_revoked(log: &ChainLog) -> Option<String> {
    let event = decode_log::<RoleRevoked>(log).ok()?;
    Some(format!(
        "Role {} was revoked from {} by {}\n\nBlockNumber {}",
        role_name(event.role),
        etherscan_address(event.account),
        etherscan_address(event.sender),
        log.block_number
    ))
}

fn event_rules(config: &BridgeConfig) -> Vec<EventRule> {
    let rule = |topic: B256,
                alert_id: &'static str,
                name: &'static str,
                severity: Severity,
                describe: fn(&ChainLog) -> Option<String>| EventRule {
        address: config.l1_bridge,
        topic,
        alert_id,
        name,
        severity,
        finding_type: FindingType::Info,
        describe,
    };
    vec![
        rule(
            DepositsEnabled::SIGNATURE_HASH,
            "L1-BRIDGE-DEPOSITS-ENABLED",
            "ℹ️ L1 bridge: Deposits enabled",
            Severity::Info,
            describe_deposits_enabled,
        ),
        rule(
            DepositsDisabled::SIGNATURE_HASH,
            "L1-BRIDGE-DEPOSITS-DISABLED",
            "🚨 L1 bridge: Deposits disabled",
            Severity::High,
            describe_deposits_disabled,
        ),
        rule(
            WithdrawalsEnabled::SIGNATURE_HASH,
            "L1-BRIDGE-WITHDRAWALS-ENABLED",
            "ℹ️ L1 bridge: Withdrawals enabled",
            Severity::Info,
            describe_withdrawals_enabled,
        ),
        rule(
            WithdrawalsDisabled::SIGNATURE_HASH,
            "L1-BRIDGE-WITHDRAWALS-DISABLED",
            "🚨 L1 bridge: Withdrawals disabled",
            Severity::High,
            describe_withdrawals_disabled,
        ),
        rule(
            RoleGranted::SIGNATURE_HASH,
            "L1-BRIDGE-ROLE-GRANTED",
            "⚠️ L1 bridge: Role granted",
            Severity::High,
            describe_role_granted,
        ),
        rule(
            RoleRevoked::SIGNATURE_HASH,
            "L1-BRIDGE-ROLE-REVOKED",
            "⚠️ L1 bridge: Role revoked",
            Severity::High,
            describe_role_revoked,
        ),
    ]
}

/// Watches one L1/L2 wstETH bridge pair.
pub struct BridgeAgent {
    l1: Arc<dyn ChainProvider>,
    l2: BlockReconciler,
    config: BridgeConfig,
    rules: Vec<EventRule>,
    withdrawals: WithdrawalsWindowMonitor,
}

impl BridgeAgent {
    pub fn new(l1: Arc<dyn ChainProvider>, l2: Arc<dyn ChainProvider>, config: BridgeConfig) -> Self {
        Self {
            l1,
            l2: BlockReconciler::new(l2, COMPONENT),
            rules: event_rules(&config),
            withdrawals: WithdrawalsWindowMonitor::new(&config),
            config,
        }
    }

    pub fn withdrawals(&self) -> &WithdrawalsWindowMonitor {
        &self.withdrawals
    }

    /// Load the withdrawals of the last window from L2 and resume L2
    /// block tracking at its head.
    async fn load_window(&mut self) -> Result<(), SourceUnavailable> {
        let l2 = self.l2.provider().clone();
        let latest = l2.get_latest_block().await.map_err(|e| {
            SourceUnavailable::new(source_tag!(COMPONENT, "initialize"), "l2.get_latest_block", e)
        })?;

        let lookback = self
            .config
            .withdrawals_window_secs
            .div_ceil(self.config.l2_block_time_secs.max(1));
        let from = latest.number.saturating_sub(lookback);
        let logs = l2
            .get_logs_in_range(from, latest.number, &[self.config.l2_token_bridge])
            .await
            .map_err(|e| {
                SourceUnavailable::new(source_tag!(COMPONENT, "initialize"), "l2.get_logs_in_range", e)
                    .at_block(latest.number)
            })?;

        let log_blocks: BTreeSet<u64> = logs.iter().map(|log| log.block_number).collect();
        let mut blocks = Vec::with_capacity(log_blocks.len());
        for number in log_blocks {
            let fetched = l2
                .get_blocks_in_range(number.saturating_sub(1), number)
                .await
                .map_err(|e| {
                    SourceUnavailable::new(source_tag!(COMPONENT, "initialize"), "l2.get_blocks_in_range", e)
                        .at_block(number)
                })?;
            blocks.extend(fetched);
        }

        let records = withdrawal_records(&logs, &blocks, &self.config);
        info!(
            "{} loaded {} {} withdrawals from L2 blocks {}..={}",
            COMPONENT,
            records.len(),
            self.config.network_name,
            from,
            latest.number
        );
        self.withdrawals.record(records);
        self.withdrawals.window.prune(latest.timestamp);
        self.l2 = BlockReconciler::resume_from(l2, COMPONENT, latest);
        Ok(())
    }

    /// Every new L2 block must keep the bridged supply covered by L1.
    async fn handle_bridge_balance(
        &self,
        l1_block: &BlockRef,
        l2_blocks: &[BlockRef],
    ) -> Result<Vec<Finding>, SourceUnavailable> {
        if l2_blocks.is_empty() {
            return Ok(Vec::new());
        }

        let call = ContractCall::new(BALANCE_OF).arg_address(self.config.l1_bridge);
        let l1_balance = self
            .l1
            .get_contract_scalar(self.config.l1_wsteth, &call, l1_block.number)
            .await
            .map_err(|e| {
                SourceUnavailable::new(
                    source_tag!(COMPONENT, "handle_bridge_balance"),
                    format!("l1.{}", BALANCE_OF),
                    e,
                )
                .at_block(l1_block.number)
            })?;

        let mut findings = Vec::new();
        for l2_block in l2_blocks {
            let supply = self
                .l2
                .provider()
                .get_contract_scalar(self.config.l2_wsteth, &ContractCall::new(TOTAL_SUPPLY), l2_block.number)
                .await
                .map_err(|e| {
                    SourceUnavailable::new(
                        source_tag!(COMPONENT, "handle_bridge_balance"),
                        format!("l2.{}", TOTAL_SUPPLY),
                        e,
                    )
                    .at_block(l2_block.number)
                });
            let Some(supply) = or_degraded(supply, &mut findings) else {
                continue;
            };
            if supply <= l1_balance {
                continue;
            }

            warn!(
                "{} wstETH supply {} exceeds L1 bridge balance {} at L2 block {}",
                self.config.network_name, supply, l1_balance, l2_block.number
            );
            let network = &self.config.network_name;
            findings.push(
                Finding::new(
                    "BRIDGE-BALANCE-MISMATCH",
                    format!("🚨🚨🚨 {} bridge balance mismatch 🚨🚨🚨", network),
                    format!(
                        "Total supply of bridged wstETH is greater than balanceOf L1 bridge side!\nL2 total supply: {}\nL1 balanceOf: {}\n\nETH: {}\n{}: {}\n",
                        fmt_wei(supply, 2),
                        fmt_wei(l1_balance, 2),
                        l1_block.number,
                        network,
                        l2_block.number
                    ),
                    Severity::Critical,
                    FindingType::Suspicious,
                )
                .with_unique_key(unique_key(BALANCE_MISMATCH_SEED, l1_block.number + l2_block.number))
                .with_metadata("l1_block", l1_block.number)
                .with_metadata("l2_block", l2_block.number),
            );
        }
        Ok(findings)
    }
}

#[async_trait]
impl Agent for BridgeAgent {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn watched_addresses(&self) -> Vec<Address> {
        vec![self.config.l1_bridge]
    }

    async fn initialize(&mut self, _start_block: &BlockRef) -> Vec<Finding> {
        let mut findings = Vec::new();
        or_degraded(self.load_window().await, &mut findings);
        findings
    }

    async fn handle_block(&mut self, block: &BlockRef) -> Vec<Finding> {
        let mut findings = Vec::new();
        let l2_blocks = or_degraded(self.l2.next_blocks().await, &mut findings).unwrap_or_default();

        if !l2_blocks.is_empty() {
            let logs = self.l2.logs_for(&l2_blocks, &[self.config.l2_token_bridge]).await;
            if let Some(logs) = or_degraded(logs, &mut findings) {
                self.withdrawals
                    .record(withdrawal_records(&logs, &l2_blocks, &self.config));
            }
            for l2_block in &l2_blocks {
                findings.extend(self.withdrawals.evaluate(l2_block));
            }
        }

        collect(&mut findings, self.handle_bridge_balance(block, &l2_blocks).await);
        findings
    }

    async fn handle_transaction(&mut self, tx: &TransactionEvent) -> Vec<Finding> {
        apply_rules(&self.rules, tx)
    }
}
