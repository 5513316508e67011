//! Withdrawal queue monitoring.
//!
//! Requests seen on chain are kept in a [`WithdrawalsRepository`] so the age
//! of the oldest unfinalized request and the claimed amounts can be checked.

use crate::config::WithdrawalsConfig;
use crate::events::{WithdrawalClaimed, WithdrawalRequested, WithdrawalsFinalized};
use crate::{collect, degrade, or_degraded, Agent};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use steth_monitor_db::{RepoError, WithdrawalRequest, WithdrawalsRepository};
use steth_monitor_heuristics::format::{fmt_duration, fmt_fixed, to_ether};
use steth_monitor_heuristics::{
    filter_logs, source_tag, AlertKey, AlertLimiter, Comparison, Finding, FindingType, Severity, SourceTag,
    SourceUnavailable,
};
use steth_monitor_provider::{u256_to_decimal, BlockRef, ChainLog, ChainProvider, ContractCall, TransactionEvent};
use tracing::{debug, info, warn};

const COMPONENT: &str = "WithdrawalsAgent";

const UNFINALIZED_STETH: &str = "unfinalizedStETH()";
const GET_LAST_FINALIZED_REQUEST_ID: &str = "getLastFinalizedRequestId()";

/// Seconds per slot, used to date replayed logs at startup.
const SLOT_SECS: u64 = 12;

fn request_id(id: U256) -> Option<u64> {
    u64::try_from(id).ok()
}

fn repo_error(origin: SourceTag, call: &'static str, e: RepoError) -> SourceUnavailable {
    SourceUnavailable::new(origin, call, e)
}

/// Build a request record from its event.
fn to_request(event: &WithdrawalRequested, timestamp: u64) -> Option<WithdrawalRequest> {
    let (Some(id), Ok(amount_of_steth), Ok(amount_of_shares)) = (
        request_id(event.requestId),
        u256_to_decimal(event.amountOfStETH),
        u256_to_decimal(event.amountOfShares),
    ) else {
        warn!("Skipping out-of-range withdrawal request {}", event.requestId);
        return None;
    };
    Some(WithdrawalRequest {
        id,
        amount_of_steth,
        amount_of_shares,
        owner: event.owner.to_string(),
        timestamp,
        is_finalized: false,
        is_claimed: false,
    })
}

/// Watches the withdrawal queue.
pub struct WithdrawalsAgent {
    provider: Arc<dyn ChainProvider>,
    repo: Arc<dyn WithdrawalsRepository>,
    config: WithdrawalsConfig,
    limiter: AlertLimiter,
    /// Claimed request ids and when they were claimed, awaiting removal.
    claimed: BTreeMap<u64, u64>,
}

impl WithdrawalsAgent {
    pub fn new(provider: Arc<dyn ChainProvider>, repo: Arc<dyn WithdrawalsRepository>, config: WithdrawalsConfig) -> Self {
        Self {
            provider,
            repo,
            config,
            limiter: AlertLimiter::new(),
            claimed: BTreeMap::new(),
        }
    }

    /// Claimed requests not yet removed from the repository.
    pub fn pending_removals(&self) -> usize {
        self.claimed.len()
    }

    async fn handle_unfinalized_queue(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let unfinalized = self
            .provider
            .get_contract_scalar(
                self.config.withdrawal_queue,
                &ContractCall::new(UNFINALIZED_STETH),
                block.number,
            )
            .await
            .and_then(u256_to_decimal)
            .map_err(|e| {
                SourceUnavailable::new(
                    source_tag!(COMPONENT, "handle_unfinalized_queue"),
                    format!("provider.{}", UNFINALIZED_STETH),
                    e,
                )
                .at_block(block.number)
            })?;
        let amount = to_ether(unfinalized);

        let tier = &self.config.big_unfinalized_queue;
        if !Comparison::Above.crosses(amount, tier.threshold) {
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
            format!(
                "⚠️ Withdrawals: unfinalized queue is more than {} stETH",
                tier.threshold.normalize()
            ),
            format!("Unfinalized queue is {} stETH", fmt_fixed(amount, 2)),
            tier.severity,
            FindingType::Info,
        )])
    }

    async fn handle_queue_wait(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let last_finalized = self
            .provider
            .get_contract_scalar(
                self.config.withdrawal_queue,
                &ContractCall::new(GET_LAST_FINALIZED_REQUEST_ID),
                block.number,
            )
            .await
            .map_err(|e| {
                SourceUnavailable::new(
                    source_tag!(COMPONENT, "handle_queue_wait"),
                    format!("provider.{}", GET_LAST_FINALIZED_REQUEST_ID),
                    e,
                )
                .at_block(block.number)
            })?;
        let Some(first_unfinalized) = request_id(last_finalized).and_then(|id| id.checked_add(1)) else {
            warn!("Unexpected last finalized request id {}", last_finalized);
            return Ok(Vec::new());
        };

        let request = match self.repo.get_by_id(first_unfinalized).await {
            Ok(request) => request,
            Err(RepoError::NotFound(_)) => {
                debug!("No pending withdrawal request after #{}", last_finalized);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(repo_error(source_tag!(COMPONENT, "handle_queue_wait"), "repo.get_by_id", e).at_block(block.number))
            }
        };
        if request.is_finalized {
            return Ok(Vec::new());
        }

        let waiting_secs = block.timestamp.saturating_sub(request.timestamp);
        let tier = &self.config.long_unfinalized_queue;
        if !Comparison::Above.crosses(Decimal::from(waiting_secs), tier.threshold) {
            return Ok(Vec::new());
        }
        if !self
            .limiter
            .try_acquire(&AlertKey::new(tier.alert_id.clone()), block.timestamp, tier.cooldown_secs)
        {
            return Ok(Vec::new());
        }

        let days = (tier.threshold / Decimal::from(86_400)).round_dp(2).normalize();
        Ok(vec![Finding::new(
            tier.alert_id.clone(),
            format!("⚠️ Withdrawals: unfinalized queue wait time is more than {} days", days),
            format!(
                "Withdrawal request #{} has been waiting for {} at the moment",
                request.id,
                fmt_duration(waiting_secs)
            ),
            tier.severity,
            FindingType::Info,
        )
        .with_metadata("request_id", request.id)])
    }

    /// Drop claimed requests once they are older than the retention period.
    async fn remove_claimed(&mut self, block: &BlockRef) -> Result<Vec<Finding>, SourceUnavailable> {
        let retention = self.config.claimed_retention_secs;
        let expired: Vec<u64> = self
            .claimed
            .iter()
            .filter(|(_, claimed_at)| block.timestamp.saturating_sub(**claimed_at) >= retention)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let removed = self
            .repo
            .remove_by_ids(&expired)
            .await
            .map_err(|e| {
                repo_error(source_tag!(COMPONENT, "remove_claimed"), "repo.remove_by_ids", e).at_block(block.number)
            })?;
        for id in &expired {
            self.claimed.remove(id);
        }
        debug!("Removed {} claimed withdrawal requests", removed);
        Ok(Vec::new())
    }

    async fn handle_requested(&mut self, tx: &TransactionEvent) -> Result<Vec<Finding>, SourceUnavailable> {
        let requests: Vec<WithdrawalRequest> = filter_logs::<WithdrawalRequested>(&tx.logs, self.config.withdrawal_queue)
            .iter()
            .filter_map(|decoded| to_request(&decoded.event, tx.block.timestamp))
            .collect();
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        self.repo
            .create_or_update(&requests)
            .await
            .map_err(|e| {
                repo_error(source_tag!(COMPONENT, "handle_requested"), "repo.create_or_update", e).at_block(tx.block.number)
            })?;
        debug!("Stored {} withdrawal requests", requests.len());
        Ok(Vec::new())
    }

    /// Finalization marks every tracked, unclaimed request in the range.
    async fn handle_finalized(&mut self, tx: &TransactionEvent) -> Result<Vec<Finding>, SourceUnavailable> {
        let ranges: Vec<(u64, u64)> = filter_logs::<WithdrawalsFinalized>(&tx.logs, self.config.withdrawal_queue)
            .into_iter()
            .filter_map(|decoded| match (request_id(decoded.event.from), request_id(decoded.event.to)) {
                (Some(from), Some(to)) => Some((from, to)),
                _ => {
                    warn!("Skipping out-of-range finalization at block {}", decoded.block_number);
                    None
                }
            })
            .collect();
        if ranges.is_empty() {
            return Ok(Vec::new());
        }

        let origin = source_tag!(COMPONENT, "handle_finalized");
        let unclaimed = self
            .repo
            .get_unclaimed_ids()
            .await
            .map_err(|e| repo_error(origin, "repo.get_unclaimed_ids", e).at_block(tx.block.number))?;

        let mut finalized = Vec::new();
        for id in unclaimed
            .into_iter()
            .filter(|id| ranges.iter().any(|(from, to)| (*from..=*to).contains(id)))
        {
            let mut request = match self.repo.get_by_id(id).await {
                Ok(request) => request,
                Err(RepoError::NotFound(_)) => continue,
                Err(e) => return Err(repo_error(origin, "repo.get_by_id", e).at_block(tx.block.number)),
            };
            if !request.is_finalized {
                request.is_finalized = true;
                finalized.push(request);
            }
        }
        if !finalized.is_empty() {
            self.repo
                .create_or_update(&finalized)
                .await
                .map_err(|e| repo_error(origin, "repo.create_or_update", e).at_block(tx.block.number))?;
        }
        for (from, to) in &ranges {
            info!("Withdrawal requests #{}..#{} finalized", from, to);
        }
        debug!("Marked {} tracked requests finalized", finalized.len());
        Ok(Vec::new())
    }

    /// Storage failures are reported next to the findings of the claims
    /// already checked; they never drop them.
    async fn handle_claimed(&mut self, tx: &TransactionEvent) -> Vec<Finding> {
        let origin = source_tag!(COMPONENT, "handle_claimed");
        let mut findings = Vec::new();
        for decoded in filter_logs::<WithdrawalClaimed>(&tx.logs, self.config.withdrawal_queue) {
            let event = decoded.event;
            let Some(id) = request_id(event.requestId) else {
                continue;
            };
            let mut request = match self.repo.get_by_id(id).await {
                Ok(request) => request,
                Err(RepoError::NotFound(_)) => {
                    debug!("Claimed request #{} was never tracked", id);
                    continue;
                }
                Err(e) => {
                    degrade(repo_error(origin, "repo.get_by_id", e).at_block(tx.block.number), &mut findings);
                    continue;
                }
            };

            match u256_to_decimal(event.amountOfETH) {
                Ok(claimed) if claimed > request.amount_of_steth => {
                    warn!(
                        "Request #{} claimed {} wei, requested {} wei",
                        id, claimed, request.amount_of_steth
                    );
                    findings.push(
                        Finding::new(
                            "WITHDRAWALS-CLAIMED-AMOUNT-MORE-THAN-REQUESTED",
                            "🚨🚨🚨 Withdrawals: claimed amount is more than requested",
                            format!(
                                "Request #{} claimed {} ETH, but only {} stETH was requested\nOwner: {}",
                                id,
                                fmt_fixed(to_ether(claimed), 4),
                                fmt_fixed(to_ether(request.amount_of_steth), 4),
                                request.owner
                            ),
                            Severity::Critical,
                            FindingType::Suspicious,
                        )
                        .with_metadata("request_id", id)
                        .with_metadata("tx", tx.hash),
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Could not convert claimed amount of request #{}: {}", id, e),
            }

            request.is_claimed = true;
            let stored = self
                .repo
                .create_or_update(std::slice::from_ref(&request))
                .await
                .map_err(|e| repo_error(origin, "repo.create_or_update", e).at_block(tx.block.number));
            if or_degraded(stored, &mut findings).is_some() {
                self.claimed.insert(id, tx.block.timestamp);
            }
        }
        findings
    }

    /// Rebuild the repository from the queue's recent logs.
    async fn replay(&mut self, start_block: &BlockRef, logs: &[ChainLog]) -> Result<(), SourceUnavailable> {
        let queue = self.config.withdrawal_queue;
        // Log timestamps are estimated from the slot distance to the start block.
        let estimate_time = |block_number: u64| {
            start_block
                .timestamp
                .saturating_sub(start_block.number.saturating_sub(block_number) * SLOT_SECS)
        };

        let mut requests: BTreeMap<u64, WithdrawalRequest> = BTreeMap::new();
        for decoded in filter_logs::<WithdrawalRequested>(logs, queue) {
            if let Some(request) = to_request(&decoded.event, estimate_time(decoded.block_number)) {
                requests.insert(request.id, request);
            }
        }
        for decoded in filter_logs::<WithdrawalsFinalized>(logs, queue) {
            if let (Some(from), Some(to)) = (request_id(decoded.event.from), request_id(decoded.event.to)) {
                for (_, request) in requests.range_mut(from..=to) {
                    request.is_finalized = true;
                }
            }
        }
        for decoded in filter_logs::<WithdrawalClaimed>(logs, queue) {
            if let Some(request) = request_id(decoded.event.requestId).and_then(|id| requests.get_mut(&id)) {
                request.is_claimed = true;
                self.claimed.insert(request.id, estimate_time(decoded.block_number));
            }
        }

        let requests: Vec<WithdrawalRequest> = requests.into_values().collect();
        self.repo
            .create_or_update(&requests)
            .await
            .map_err(|e| {
                repo_error(source_tag!(COMPONENT, "initialize"), "repo.create_or_update", e).at_block(start_block.number)
            })?;
        info!(
            "{} replayed {} withdrawal requests ({} claimed)",
            COMPONENT,
            requests.len(),
            self.claimed.len()
        );
        Ok(())
    }
}

#[async_trait]
impl Agent for WithdrawalsAgent {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn watched_addresses(&self) -> Vec<Address> {
        vec![self.config.withdrawal_queue]
    }

    async fn initialize(&mut self, start_block: &BlockRef) -> Vec<Finding> {
        let mut findings = Vec::new();
        let from = start_block.number.saturating_sub(self.config.init_lookback_blocks);
        let logs = self
            .provider
            .get_logs_in_range(from, start_block.number, &[self.config.withdrawal_queue])
            .await
            .map_err(|e| {
                SourceUnavailable::new(source_tag!(COMPONENT, "initialize"), "provider.get_logs_in_range", e)
                    .at_block(start_block.number)
            });
        if let Some(logs) = or_degraded(logs, &mut findings) {
            or_degraded(self.replay(start_block, &logs).await, &mut findings);
        }
        findings
    }

    async fn handle_block(&mut self, block: &BlockRef) -> Vec<Finding> {
        let mut findings = Vec::new();
        collect(&mut findings, self.handle_unfinalized_queue(block).await);
        collect(&mut findings, self.handle_queue_wait(block).await);
        collect(&mut findings, self.remove_claimed(block).await);
        findings
    }

    async fn handle_transaction(&mut self, tx: &TransactionEvent) -> Vec<Finding> {
        let mut findings = Vec::new();
        collect(&mut findings, self.handle_requested(tx).await);
        collect(&mut findings, self.handle_finalized(tx).await);
        findings.extend(self.handle_claimed(tx).await);
        findings
    }
}
