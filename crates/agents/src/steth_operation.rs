//! stETH protocol operations: share rate invariant, buffered ether,
//! depositable ether, deposit executor balance, staking limit and the
//! admin events of the Lido contract.

use crate::config::StethConfig;
use crate::events::{
    apply_rules, EventRule, OwnershipTransferred, StakingLimitRemoved, StakingLimitSet, StakingPaused, StakingResumed,
    TokenRebased, Unbuffered, WithdrawalsFinalized,
};
use crate::{collect, or_degraded, Agent};
use alloy::primitives::{Address, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use rust_decimal::Decimal;
use std::sync::Arc;
use steth_monitor_heuristics::decoder::decode_log;
use steth_monitor_heuristics::format::{etherscan_address, fmt_fixed, fmt_sci, fmt_wei, to_ether};
use steth_monitor_heuristics::{
    check_delta, filter_logs, source_tag, AlertKey, AlertLimiter, Comparison, Finding, FindingType, Severity, Snapshot,
    SourceTag, SourceUnavailable, TieredThreshold,
};
use steth_monitor_provider::{u256_to_big, u256_to_decimal, BlockRef, ChainLog, ChainProvider, ContractCall, TransactionEvent};
use tracing::{debug, info, warn};

const COMPONENT: &str = "StethOperationAgent";

const GET_POOLED_ETH_BY_SHARES: &str = "getPooledEthByShares(uint256)";
const GET_BUFFERED_ETHER: &str = "getBufferedEther()";
const GET_DEPOSITABLE_ETHER: &str = "getDepositableEther()";
const GET_STAKE_LIMIT_FULL_INFO: &str = "getStakeLimitFullInfo()";

const DEPOSITABLE_ETH_KEY: &str = "DEPOSITABLE-ETH";

/// Shares used to sample the share rate.
fn share_rate_unit() -> U256 {
    U256::from(10u64).pow(U256::from(27u64))
}

fn describe_staking_paused(log: &ChainLog) -> Option<String> {
    Some(format!("Staking was paused!\n\nBlockNumber {}", log.block_number))
}

fn describe_staking_resumed(log: &ChainLog) -> Option<String> {
    Some(format!("Staking was resumed!\n\nBlockNumber {}", log.block_number))
}

fn describe_staking_limit_set(log: &ChainLog) -> Option<String> {
    let event = decode_log::<StakingLimitSet>(log).ok()?;
    Some(format!(
        "Staking limit was set with:\nMax staking limit: {}\nStake limit increase per block: {}\n\nBlockNumber {}",
        event.maxStakeLimit, event.stakeLimitIncreasePerBlock, log.block_number
    ))
}

fn describe_staking_limit_removed(log: &ChainLog) -> Option<String> {
    Some(format!("Staking limit was removed!\n\nBlockNumber {}", log.block_number))
}

fn describe_ownership_transferred(log: &ChainLog) -> Option<String> {
    let event = decode_log::<OwnershipTransferred>(log).ok()?;
    Some(format!(
        "Owner of the insurance fund was transferred from {} to {}\n\nBlockNumber {}",
        etherscan_address(event.previousOwner),
        etherscan_address(event.newOwner),
        log.block_number
    ))
}

fn event_rules(config: &StethConfig) -> Vec<EventRule> {
    vec![
        EventRule {
            address: config.lido,
            topic: StakingPaused::SIGNATURE_HASH,
            alert_id: "LIDO-STAKING-PAUSED",
            name: "🚨 Lido: Staking paused",
            severity: Severity::Critical,
            finding_type: FindingType::Info,
            describe: describe_staking_paused,
        },
        EventRule {
            address: config.lido,
            topic: StakingResumed::SIGNATURE_HASH,
            alert_id: "LIDO-STAKING-RESUMED",
            name: "⚠️ Lido: Staking resumed",
            severity: Severity::Medium,
            finding_type: FindingType::Info,
            describe: describe_staking_resumed,
        },
        EventRule {
            address: config.lido,
            topic: StakingLimitSet::SIGNATURE_HASH,
            alert_id: "LIDO-STAKING-LIMIT-SET",
            name: "⚠️ Lido: Staking limit set",
            severity: Severity::Medium,
            finding_type: FindingType::Info,
            describe: describe_staking_limit_set,
        },
        EventRule {
            address: config.lido,
            topic: StakingLimitRemoved::SIGNATURE_HASH,
            alert_id: "LIDO-STAKING-LIMIT-REMOVED",
            name: "🚨 Lido: Staking limit removed",
            severity: Severity::High,
            finding_type: FindingType::Info,
            describe: describe_staking_limit_removed,
        },
        EventRule {
            address: config.insurance_fund,
            topic: OwnershipTransferred::SIGNATURE_HASH,
            alert_id: "INS-FUND-OWNERSHIP-TRANSFERRED",
            name: "🚨 Insurance fund: Ownership transferred",
            severity: Severity::High,
            finding_type: FindingType::Info,
            describe: describe_ownership_transferred,
        },
    ]
}

/// Watches the Lido core contract.
pub struct StethOperationAgent {
    provider: Arc<dyn ChainProvider>,
    config: StethConfig,
    rules: Vec<EventRule>,
    depositable: TieredThreshold,
    staking_limit: TieredThreshold,
    limiter: AlertLimiter,
    share_rate: Option<Snapshot>,
    buffered_eth: Option<Snapshot<U256>>,
    /// Unknown until the depositor history has been read or a deposit is seen.
    last_depositor_time: Option<u64>,
    huge_depositable_since: Option<u64>,
}

impl StethOperationAgent {
    pub fn new(provider: Arc<dyn ChainProvider>, config: StethConfig) -> Self {
        let depositable = TieredThreshold::new(
            Comparison::Above,
            vec![config.high_depositable_eth.clone(), config.huge_depositable_eth.clone()],
        );
        let staking_limit = TieredThreshold::new(Comparison::Below, config.staking_limit.clone());
        Self {
            provider,
            rules: event_rules(&config),
            config,
            depositable,
            staking_limit,
            limiter: AlertLimiter::new(),
            share_rate: None,
            buffered_eth: None,
            last_depositor_time: None,
            huge_depositable_since: None,
        }
    }

    pub fn share_rate(&self) -> Option<&Snapshot> {
        self.share_rate.as_ref()
    }

    pub fn last_depositor_time(&self) -> Option<u64> {
        self.last_depositor_time
    }

    async fn read(
        &self,
        origin: SourceTag,
        contract: Address,
        call: ContractCall,
        block: u64,
    ) -> Result<U256, SourceUnavailable> {
        self.provider
            .get_contract_scalar(contract, &call, block)
            .await
            .map_err(|e| SourceUnavailable::new(origin, format!("provider.{}", call.signature), e).at_block(block))
    }

    /// Read a wei amount for threshold arithmetic.
    async fn read_amount(
        &self,
        origin: SourceTag,
        contract: Address,
        call: ContractCall,
        block: u64,
    ) -> Result<Decimal, SourceUnavailable> {
        let signature = call.signature;
        let word = self.read(origin, contract, call, block).await?;
        u256_to_decimal(word)
            .map_err(|e| SourceUnavailable::new(origin, format!("provider.{}", signature), e).at_block(block))
    }

    async fn read_share_rate(&self, origin: SourceTag, block: u64) -> Result<BigDecimal, SourceUnavailable> {
        let call = ContractCall::new(GET_POOLED_ETH_BY_SHARES).arg_uint(share_rate_unit());
        self.read(origin, self.config.lido, call, block).await.map(u256_to_big)
    }

    /// The share rate may only move on a rebase.
    async fn handle_share_rate(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let value = self
            .read_share_rate(source_tag!(COMPONENT, "handle_share_rate"), block.number)
            .await?;
        let current = Snapshot {
            value,
            block_number: block.number,
        };

        let Some(previous) = self.share_rate.replace(current.clone()) else {
            return Ok(Vec::new());
        };
        let Some(violation) = check_delta(&previous, &current, &self.config.share_rate_epsilon) else {
            return Ok(Vec::new());
        };

        warn!(
            "Share rate moved from {} at block {} to {} at block {}",
            violation.previous.value, violation.previous.block_number, violation.current.value, block.number
        );
        Ok(vec![Finding::new(
            "LIDO-INVARIANT-ERROR",
            "🚨🚨🚨 Share rate unexpected has changed",
            format!(
                "Prev.shareRate({}) = {} \nCurr.shareRate({}) = {} \nDiff: {}",
                violation.previous.block_number,
                fmt_sci(&violation.previous.value),
                violation.current.block_number,
                fmt_sci(&violation.current.value),
                fmt_sci(&violation.diff)
            ),
            Severity::Critical,
            FindingType::Suspicious,
        )
        .with_metadata("block", block.number)])
    }

    /// Buffered ether may only decrease through deposits or withdrawal
    /// finalization. Checked a few blocks behind the head so the node has
    /// settled the logs.
    async fn handle_buffered_eth(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let handled = match block.number.checked_sub(self.config.buffered_eth_lag_blocks) {
            Some(handled) if handled > 0 => handled,
            _ => return Ok(Vec::new()),
        };
        let parent = handled - 1;
        let lido = self.config.lido;

        let previous = match self.buffered_eth {
            Some(snapshot) if snapshot.block_number == parent => snapshot.value,
            _ => {
                self.read(
                    source_tag!(COMPONENT, "handle_buffered_eth"),
                    lido,
                    ContractCall::new(GET_BUFFERED_ETHER),
                    parent,
                )
                .await?
            }
        };
        let current = self
            .read(
                source_tag!(COMPONENT, "handle_buffered_eth"),
                lido,
                ContractCall::new(GET_BUFFERED_ETHER),
                handled,
            )
            .await?;
        self.buffered_eth = Some(Snapshot {
            value: current,
            block_number: handled,
        });

        if current >= previous {
            return Ok(Vec::new());
        }

        let queue = self.config.withdrawal_queue;
        let logs = self
            .provider
            .get_logs_in_range(handled, handled, &[lido, queue])
            .await
            .map_err(|e| {
                SourceUnavailable::new(source_tag!(COMPONENT, "handle_buffered_eth"), "provider.get_logs_in_range", e)
                    .at_block(handled)
            })?;
        let explained = !filter_logs::<Unbuffered>(&logs, lido).is_empty()
            || !filter_logs::<WithdrawalsFinalized>(&logs, queue).is_empty();
        if explained {
            debug!("Buffered ether decrease at block {} is explained by events", handled);
            return Ok(Vec::new());
        }

        Ok(vec![Finding::new(
            "BUFFERED-ETH-DRAIN",
            "🚨🚨🚨 Buffered ETH drain",
            format!(
                "Buffered ETH amount decreased from {} to {} without Unbuffered or WithdrawalsFinalized events\n\nNote: actual handled block number is {}",
                fmt_wei(previous, 2),
                fmt_wei(current, 2),
                handled
            ),
            Severity::Critical,
            FindingType::Suspicious,
        )
        .with_metadata("block", handled)])
    }

    async fn handle_depositable_eth(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let depositable = self
            .read_amount(
                source_tag!(COMPONENT, "handle_depositable_eth"),
                self.config.lido,
                ContractCall::new(GET_DEPOSITABLE_ETHER),
                block.number,
            )
            .await?;
        let amount = to_ether(depositable);
        let now = block.timestamp;

        let huge = &self.config.huge_depositable_eth;
        if Comparison::Above.crosses(amount, huge.threshold) {
            self.huge_depositable_since.get_or_insert(now);
        } else {
            self.huge_depositable_since = None;
        }

        let key = AlertKey::new(DEPOSITABLE_ETH_KEY);
        let idle_secs = self.last_depositor_time.map(|time| now.saturating_sub(time));
        let huge_for_secs = self.huge_depositable_since.map(|since| now.saturating_sub(since));

        let mut findings = Vec::new();
        for tier in self.depositable.crossed(amount) {
            let finding = if tier.alert_id == huge.alert_id {
                if huge_for_secs.map_or(true, |secs| secs < self.config.huge_depositable_min_duration_secs) {
                    continue;
                }
                Finding::new(
                    tier.alert_id.clone(),
                    "🚨 Huge depositable ETH amount",
                    format!(
                        "There are {} depositable ETH in DAO for more than {} hour(s)",
                        fmt_fixed(amount, 2),
                        self.config.huge_depositable_min_duration_secs / 3_600
                    ),
                    tier.severity,
                    FindingType::Suspicious,
                )
            } else {
                let Some(idle_secs) = idle_secs else {
                    debug!("Depositor activity unknown, skipping {}", tier.alert_id);
                    continue;
                };
                if idle_secs <= self.config.max_depositor_idle_secs {
                    continue;
                }
                Finding::new(
                    tier.alert_id.clone(),
                    "⚠️ High depositable ETH amount",
                    format!(
                        "There are {} depositable ETH in DAO and there are more than {} hours since last Depositor TX",
                        fmt_fixed(amount, 2),
                        self.config.max_depositor_idle_secs / 3_600
                    ),
                    tier.severity,
                    FindingType::Suspicious,
                )
            };
            if self.limiter.try_acquire(&key, now, tier.cooldown_secs) {
                findings.push(finding.with_metadata("block", block.number));
            }
            break;
        }
        Ok(findings)
    }

    async fn handle_deposit_executor_balance(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let executor = self.config.deposit_executor;
        let balance = self.provider.get_balance(executor, block.number).await.map_err(|e| {
            SourceUnavailable::new(
                source_tag!(COMPONENT, "handle_deposit_executor_balance"),
                "provider.get_balance",
                e,
            )
            .at_block(block.number)
        })?;
        let balance = to_ether(balance);

        let tier = &self.config.deposit_executor_balance;
        if !Comparison::Below.crosses(balance, tier.threshold) {
            return Ok(Vec::new());
        }
        if !self
            .limiter
            .try_acquire(&AlertKey::new(tier.alert_id.clone()), block.timestamp, tier.cooldown_secs)
        {
            return Ok(Vec::new());
        }

        Ok(vec![Finding::new(
            tier.alert_id.clone(),
            "⚠️ Low deposit executor balance",
            format!(
                "Balance of deposit executor is {}. This is extremely low! 😱",
                fmt_fixed(balance, 4)
            ),
            tier.severity,
            FindingType::Suspicious,
        )
        .with_metadata("address", executor)])
    }

    async fn handle_staking_limit(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let lido = self.config.lido;
        // With no limit set the max reads zero and the current limit reads uint256 max.
        let max = self
            .read(
                source_tag!(COMPONENT, "handle_staking_limit"),
                lido,
                ContractCall::new(GET_STAKE_LIMIT_FULL_INFO).output(3),
                block.number,
            )
            .await?;
        if max.is_zero() {
            debug!("Staking limit is not set at block {}", block.number);
            return Ok(Vec::new());
        }
        let current = self
            .read(
                source_tag!(COMPONENT, "handle_staking_limit"),
                lido,
                ContractCall::new(GET_STAKE_LIMIT_FULL_INFO).output(2),
                block.number,
            )
            .await?
            .min(max);
        let (Ok(current), Ok(max)) = (u256_to_decimal(current), u256_to_decimal(max)) else {
            warn!("Staking limit {} is out of range at block {}", max, block.number);
            return Ok(Vec::new());
        };

        let Some(tier) = self.staking_limit.evaluate(current / max) else {
            return Ok(Vec::new());
        };
        let percent = (tier.threshold * Decimal::ONE_HUNDRED).normalize();
        let key = AlertKey::with_sub_id(tier.alert_id.clone(), percent);
        if !self.limiter.try_acquire(&key, block.timestamp, tier.cooldown_secs) {
            return Ok(Vec::new());
        }

        let (name, description) = if tier.severity >= Severity::Medium {
            (
                format!("⚠️ Unspent staking limit below {}%", percent),
                format!("Current staking limit is lower than {}% of max staking limit", percent),
            )
        } else {
            (
                format!("📉 Unspent staking limit below {}%", percent),
                format!(
                    "Current staking limit is {} ETH this is lower than {}% of max staking limit {} ETH",
                    fmt_fixed(to_ether(current), 2),
                    percent,
                    fmt_fixed(to_ether(max), 2)
                ),
            )
        };
        Ok(vec![Finding::new(
            tier.alert_id.clone(),
            name,
            description,
            tier.severity,
            FindingType::Info,
        )])
    }

    fn handle_rebase(&mut self, tx: &TransactionEvent) {
        let Some(rebase) = filter_logs::<TokenRebased>(&tx.logs, self.config.lido).pop() else {
            return;
        };
        let event = rebase.event;
        if event.postTotalShares.is_zero() {
            warn!("Ignoring rebase with zero total shares at block {}", rebase.block_number);
            return;
        }
        // Same integer division the contract does for getPooledEthByShares.
        let Some(scaled) = event.postTotalEther.checked_mul(share_rate_unit()) else {
            warn!("Ignoring rebase with out-of-range total ether at block {}", rebase.block_number);
            return;
        };
        let value = u256_to_big(scaled / event.postTotalShares);
        info!("Share rate re-seeded by rebase at block {}: {}", rebase.block_number, value);
        self.share_rate = Some(Snapshot {
            value,
            block_number: rebase.block_number,
        });
    }
}

#[async_trait]
impl Agent for StethOperationAgent {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn watched_addresses(&self) -> Vec<Address> {
        vec![self.config.lido, self.config.insurance_fund]
    }

    async fn initialize(&mut self, start_block: &BlockRef) -> Vec<Finding> {
        let mut findings = Vec::new();
        let dsm = self.config.deposit_security_module;
        let since = start_block
            .number
            .saturating_sub(self.config.depositor_history_lookback_blocks);
        let history = self.provider.get_transaction_history(dsm, since).await.map_err(|e| {
            SourceUnavailable::new(source_tag!(COMPONENT, "initialize"), "provider.get_transaction_history", e)
                .at_block(start_block.number)
        });
        if let Some(history) = or_degraded(history, &mut findings) {
            let last = history.iter().filter(|tx| tx.to == Some(dsm)).map(|tx| tx.timestamp).max();
            if last.is_none() {
                warn!("No depositor transactions since block {}", since);
            }
            // No deposit inside the lookback window counts as idle since genesis.
            self.last_depositor_time = Some(last.unwrap_or(0));
        }

        let share_rate = self
            .read_share_rate(source_tag!(COMPONENT, "initialize"), start_block.number)
            .await;
        if let Some(value) = or_degraded(share_rate, &mut findings) {
            self.share_rate = Some(Snapshot {
                value,
                block_number: start_block.number,
            });
        }

        if let Some(seed_block) = start_block.number.checked_sub(self.config.buffered_eth_lag_blocks + 1) {
            let buffered = self
                .read(
                    source_tag!(COMPONENT, "initialize"),
                    self.config.lido,
                    ContractCall::new(GET_BUFFERED_ETHER),
                    seed_block,
                )
                .await;
            if let Some(value) = or_degraded(buffered, &mut findings) {
                self.buffered_eth = Some(Snapshot {
                    value,
                    block_number: seed_block,
                });
            }
        }

        info!(
            "{} initialized at block {} with {} failures, last depositor tx at {:?}",
            COMPONENT,
            start_block.number,
            findings.len(),
            self.last_depositor_time
        );
        findings
    }

    async fn handle_block(&mut self, block: &BlockRef) -> Vec<Finding> {
        let mut findings = Vec::new();
        collect(&mut findings, self.handle_share_rate(block).await);
        collect(&mut findings, self.handle_buffered_eth(block).await);
        collect(&mut findings, self.handle_depositable_eth(block).await);
        collect(&mut findings, self.handle_deposit_executor_balance(block).await);
        collect(&mut findings, self.handle_staking_limit(block).await);
        findings
    }

    async fn handle_transaction(&mut self, tx: &TransactionEvent) -> Vec<Finding> {
        if !filter_logs::<Unbuffered>(&tx.logs, self.config.lido).is_empty() {
            debug!("Depositor activity at block {}", tx.block.number);
            let time = tx.block.timestamp;
            self.last_depositor_time = Some(self.last_depositor_time.map_or(time, |last| last.max(time)));
        }
        self.handle_rebase(tx);
        apply_rules(&self.rules, tx)
    }
}
