//! Turns successive chain-head polls into a gapless, ordered block sequence.

use alloy::primitives::{Address, B256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use steth_monitor_heuristics::{source_tag, SourceUnavailable};
use steth_monitor_provider::{BlockRef, ChainLog, ChainProvider, TransactionEvent};
use tracing::{debug, info, warn};

/// Reconciler progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Nothing processed yet, or the last poll failed.
    ColdStart,
    /// Every block up to and including `checkpoint` has been emitted.
    Warm { checkpoint: BlockRef },
}

/// Block source for one chain.
pub struct BlockReconciler {
    provider: Arc<dyn ChainProvider>,
    component: &'static str,
    state: ReconcilerState,
}

impl BlockReconciler {
    /// Create a reconciler in the cold state.
    ///
    /// # Arguments
    /// * `provider` - Chain the blocks come from
    /// * `component` - Name used in degraded findings
    pub fn new(provider: Arc<dyn ChainProvider>, component: &'static str) -> Self {
        Self {
            provider,
            component,
            state: ReconcilerState::ColdStart,
        }
    }

    /// Create a reconciler that resumes after `checkpoint`.
    pub fn resume_from(provider: Arc<dyn ChainProvider>, component: &'static str, checkpoint: BlockRef) -> Self {
        Self {
            provider,
            component,
            state: ReconcilerState::Warm { checkpoint },
        }
    }

    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    pub fn checkpoint(&self) -> Option<&BlockRef> {
        match &self.state {
            ReconcilerState::ColdStart => None,
            ReconcilerState::Warm { checkpoint } => Some(checkpoint),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ChainProvider> {
        &self.provider
    }

    /// Poll the chain head and return the blocks not emitted yet.
    ///
    /// # Returns
    /// Blocks in ascending order with no duplicates and nothing at or below
    /// the previous checkpoint. Any failure drops the reconciler back to
    /// the cold state and is reported for this call only.
    pub async fn next_blocks(&mut self) -> Result<Vec<BlockRef>, SourceUnavailable> {
        let latest = match self.provider.get_latest_block().await {
            Ok(latest) => latest,
            Err(e) => {
                self.reset();
                return Err(SourceUnavailable::new(
                    source_tag!(self.component, "next_blocks"),
                    "provider.get_latest_block",
                    e,
                ));
            }
        };

        let checkpoint = match &self.state {
            ReconcilerState::ColdStart => {
                info!("{}: cold start at block {}", self.component, latest.number);
                self.state = ReconcilerState::Warm {
                    checkpoint: latest.clone(),
                };
                return Ok(vec![latest]);
            }
            ReconcilerState::Warm { checkpoint } => checkpoint.clone(),
        };

        if latest.number <= checkpoint.number {
            debug!("{}: no new blocks, latest: {}", self.component, latest.number);
            return Ok(Vec::new());
        }

        let mut blocks = match self
            .provider
            .get_blocks_in_range(checkpoint.number, latest.number.saturating_sub(1))
            .await
        {
            Ok(blocks) => blocks,
            Err(e) => {
                self.reset();
                return Err(SourceUnavailable::new(
                    source_tag!(self.component, "next_blocks"),
                    "provider.get_blocks_in_range",
                    e,
                )
                .at_block(latest.number));
            }
        };

        blocks.push(latest);
        blocks.sort_by_key(|block| block.number);
        blocks.dedup_by_key(|block| block.number);
        blocks.retain(|block| block.number > checkpoint.number);

        if let Some(last) = blocks.last() {
            self.state = ReconcilerState::Warm {
                checkpoint: last.clone(),
            };
        }
        debug!(
            "{}: emitting {} blocks after checkpoint {}",
            self.component,
            blocks.len(),
            checkpoint.number
        );
        Ok(blocks)
    }

    /// Fetch the logs emitted by `addresses` within `blocks`.
    ///
    /// Logs from blocks outside `blocks` are dropped.
    pub async fn logs_for(&self, blocks: &[BlockRef], addresses: &[Address]) -> Result<Vec<ChainLog>, SourceUnavailable> {
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return Ok(Vec::new());
        };

        let logs = self
            .provider
            .get_logs_in_range(first.number, last.number, addresses)
            .await
            .map_err(|e| {
                SourceUnavailable::new(source_tag!(self.component, "logs_for"), "provider.get_logs_in_range", e)
                    .at_block(last.number)
            })?;

        let known: std::collections::HashSet<u64> = blocks.iter().map(|b| b.number).collect();
        let (kept, dropped): (Vec<ChainLog>, Vec<ChainLog>) =
            logs.into_iter().partition(|log| known.contains(&log.block_number));
        if !dropped.is_empty() {
            warn!(
                "{}: dropped {} logs from blocks outside the reconciled range",
                self.component,
                dropped.len()
            );
        }
        Ok(kept)
    }

    fn reset(&mut self) {
        if self.state != ReconcilerState::ColdStart {
            warn!("{}: resetting to cold start", self.component);
        }
        self.state = ReconcilerState::ColdStart;
    }
}

/// Group logs into transactions, attaching each transaction's block.
///
/// # Arguments
/// * `logs` - Logs in any order
/// * `blocks` - Blocks the logs belong to
///
/// # Returns
/// Transactions ordered by block and by the position of their first log.
/// Logs without a transaction hash or a known block are skipped.
pub fn group_transactions(mut logs: Vec<ChainLog>, blocks: &[BlockRef]) -> Vec<TransactionEvent> {
    let blocks_by_number: HashMap<u64, &BlockRef> = blocks.iter().map(|b| (b.number, b)).collect();
    logs.sort_by_key(|log| (log.block_number, log.log_index));

    let mut order: BTreeMap<(u64, u64), B256> = BTreeMap::new();
    let mut grouped: HashMap<B256, TransactionEvent> = HashMap::new();

    for log in logs {
        let (Some(hash), Some(block)) = (log.transaction_hash, blocks_by_number.get(&log.block_number)) else {
            debug!("Skipping log at block {} index {}", log.block_number, log.log_index);
            continue;
        };
        grouped
            .entry(hash)
            .or_insert_with(|| {
                order.insert((log.block_number, log.log_index), hash);
                TransactionEvent {
                    hash,
                    to: None,
                    block: (*block).clone(),
                    logs: Vec::new(),
                }
            })
            .logs
            .push(log);
    }

    order
        .into_values()
        .filter_map(|hash| grouped.remove(&hash))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;
    use steth_monitor_provider::fixture::FixtureProvider;

    fn log(block_number: u64, log_index: u64, tx: u8) -> ChainLog {
        ChainLog {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::new(),
            block_number,
            log_index,
            transaction_hash: Some(B256::repeat_byte(tx)),
        }
    }

    #[tokio::test]
    async fn test_cold_start_emits_latest_only() {
        let provider = Arc::new(FixtureProvider::new());
        provider.push_blocks(1, 10, 1_000);
        let mut reconciler = BlockReconciler::new(provider.clone(), "TestReconciler");

        let blocks = reconciler.next_blocks().await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].number, 10);
        assert_eq!(reconciler.checkpoint().map(|b| b.number), Some(10));

        assert!(reconciler.next_blocks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_from_checkpoint() {
        let provider = Arc::new(FixtureProvider::new());
        provider.push_blocks(100, 105, 1_000);
        let checkpoint = BlockRef::new(100, 1_000);
        let mut reconciler = BlockReconciler::resume_from(provider.clone(), "TestReconciler", checkpoint);

        let numbers: Vec<u64> = reconciler
            .next_blocks()
            .await
            .unwrap()
            .iter()
            .map(|b| b.number)
            .collect();
        assert_eq!(numbers, vec![101, 102, 103, 104, 105]);
        assert_eq!(reconciler.checkpoint().map(|b| b.number), Some(105));
    }

    #[tokio::test]
    async fn test_failure_resets_to_cold_start() {
        let provider = Arc::new(FixtureProvider::new());
        provider.push_blocks(1, 5, 1_000);
        let mut reconciler = BlockReconciler::resume_from(provider.clone(), "TestReconciler", BlockRef::new(3, 976));

        provider.fail("get_blocks_in_range");
        let err = reconciler.next_blocks().await.unwrap_err();
        assert_eq!(err.call, "provider.get_blocks_in_range");
        assert_eq!(reconciler.state(), &ReconcilerState::ColdStart);

        provider.recover("get_blocks_in_range");
        provider.push_blocks(6, 6, 1_060);
        let blocks = reconciler.next_blocks().await.unwrap();
        assert_eq!(blocks.iter().map(|b| b.number).collect::<Vec<_>>(), vec![6]);
    }

    #[tokio::test]
    async fn test_latest_failure_yields_network_finding() {
        let provider = Arc::new(FixtureProvider::new());
        provider.push_blocks(1, 2, 1_000);
        let mut reconciler = BlockReconciler::new(provider.clone(), "TestReconciler");
        provider.fail("get_latest_block");

        let finding = reconciler.next_blocks().await.unwrap_err().to_finding();
        assert_eq!(finding.alert_id, "NETWORK-ERROR");
        assert_eq!(finding.description, "Could not call provider.get_latest_block");
        assert!(finding.name.starts_with("Error in TestReconciler.next_blocks:"));
    }

    #[tokio::test]
    async fn test_logs_for_drops_unknown_blocks() {
        let provider = Arc::new(FixtureProvider::new());
        provider.push_blocks(1, 3, 1_000);
        provider.push_log(log(2, 0, 1));
        provider.push_log(log(3, 0, 2));
        let reconciler = BlockReconciler::new(provider.clone(), "TestReconciler");

        let blocks = vec![BlockRef::new(3, 1_024)];
        let logs = reconciler.logs_for(&blocks, &[]).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 3);

        assert!(reconciler.logs_for(&[], &[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_group_transactions() {
        let blocks = vec![BlockRef::new(10, 1_000), BlockRef::new(11, 1_012)];
        let logs = vec![log(11, 0, 3), log(10, 4, 2), log(10, 1, 1), log(10, 2, 2), log(10, 3, 1)];

        let txs = group_transactions(logs, &blocks);
        let hashes: Vec<B256> = txs.iter().map(|t| t.hash).collect();
        assert_eq!(hashes, vec![B256::repeat_byte(1), B256::repeat_byte(2), B256::repeat_byte(3)]);
        assert_eq!(txs[0].logs.len(), 2);
        assert_eq!(txs[0].block.timestamp, 1_000);
        assert_eq!(txs[2].block.timestamp, 1_012);
    }
}
