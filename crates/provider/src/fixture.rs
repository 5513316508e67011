//! Scripted in-memory provider.
//!
//! Used by agent tests and dry runs. State is set up front with the `set_*`
//! and `push_*` methods; any method name or call signature can be made to
//! fail with [`FixtureProvider::fail`].

use crate::{BlockRef, ChainLog, ChainProvider, ChainTransaction, ContractCall, ProviderError, ProviderResult};
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

type ScalarKey = (Address, &'static str, usize);

/// A value the fixture can serve as a raw output word.
pub trait FixtureWord {
    fn into_word(self) -> U256;
}

impl FixtureWord for U256 {
    fn into_word(self) -> U256 {
        self
    }
}

impl FixtureWord for u64 {
    fn into_word(self) -> U256 {
        U256::from(self)
    }
}

/// The integer part of the decimal; negative values serve as zero.
impl FixtureWord for Decimal {
    fn into_word(self) -> U256 {
        self.trunc().to_u128().map(U256::from).unwrap_or(U256::ZERO)
    }
}

#[derive(Default)]
struct FixtureState {
    latest: Option<u64>,
    blocks: BTreeMap<u64, BlockRef>,
    logs: Vec<ChainLog>,
    balances: HashMap<Address, Decimal>,
    block_balances: HashMap<(Address, u64), Decimal>,
    scalars: HashMap<ScalarKey, U256>,
    block_scalars: HashMap<(ScalarKey, u64), U256>,
    history: HashMap<Address, Vec<ChainTransaction>>,
    failures: HashSet<String>,
    calls: Vec<String>,
}

/// In-memory [`ChainProvider`].
#[derive(Default)]
pub struct FixtureProvider {
    state: Mutex<FixtureState>,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a block and make it the chain head.
    pub fn push_block(&self, block: BlockRef) {
        let mut state = self.state();
        state.latest = Some(block.number);
        state.blocks.insert(block.number, block);
    }

    /// Add blocks `from..=to`, spaced 12 seconds apart starting at `first_timestamp`.
    pub fn push_blocks(&self, from: u64, to: u64, first_timestamp: u64) {
        for number in from..=to {
            self.push_block(BlockRef::new(number, first_timestamp + (number - from) * 12));
        }
    }

    /// Move the chain head to an already known block.
    pub fn set_latest(&self, number: u64) {
        self.state().latest = Some(number);
    }

    pub fn push_log(&self, log: ChainLog) {
        self.state().logs.push(log);
    }

    pub fn set_balance(&self, address: Address, value: Decimal) {
        self.state().balances.insert(address, value);
    }

    pub fn set_balance_at(&self, address: Address, block: u64, value: Decimal) {
        self.state().block_balances.insert((address, block), value);
    }

    /// Set the first output word of a call for every block.
    pub fn set_scalar(&self, contract: Address, signature: &'static str, value: impl FixtureWord) {
        self.set_scalar_output(contract, signature, 0, value);
    }

    pub fn set_scalar_output(
        &self,
        contract: Address,
        signature: &'static str,
        output_index: usize,
        value: impl FixtureWord,
    ) {
        self.state()
            .scalars
            .insert((contract, signature, output_index), value.into_word());
    }

    /// Override the first output word of a call at one block.
    pub fn set_scalar_at(&self, contract: Address, signature: &'static str, block: u64, value: impl FixtureWord) {
        self.state()
            .block_scalars
            .insert(((contract, signature, 0), block), value.into_word());
    }

    pub fn push_history(&self, address: Address, tx: ChainTransaction) {
        self.state().history.entry(address).or_default().push(tx);
    }

    /// Make every request matching `key` fail. The key is either a trait
    /// method name (`get_balance`) or a call signature (`getBufferedEther()`).
    pub fn fail(&self, key: &str) {
        self.state().failures.insert(key.to_string());
    }

    pub fn recover(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Requests served so far, as `method` or `method:signature`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn check(state: &mut FixtureState, method: &str, signature: Option<&str>) -> ProviderResult<()> {
        state.calls.push(match signature {
            Some(signature) => format!("{}:{}", method, signature),
            None => method.to_string(),
        });
        if state.failures.contains(method) {
            return Err(ProviderError::Rpc(format!("injected failure in {}", method)));
        }
        if let Some(signature) = signature {
            if state.failures.contains(signature) {
                return Err(ProviderError::Rpc(format!("injected failure in {}", signature)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChainProvider for FixtureProvider {
    async fn get_latest_block(&self) -> ProviderResult<BlockRef> {
        let mut state = self.state();
        Self::check(&mut state, "get_latest_block", None)?;
        let latest = state
            .latest
            .ok_or_else(|| ProviderError::NotAvailable("no blocks".to_string()))?;
        state
            .blocks
            .get(&latest)
            .cloned()
            .ok_or(ProviderError::BlockNotFound(latest))
    }

    async fn get_blocks_in_range(&self, from_exclusive: u64, to_inclusive: u64) -> ProviderResult<Vec<BlockRef>> {
        let mut state = self.state();
        Self::check(&mut state, "get_blocks_in_range", None)?;
        if from_exclusive >= to_inclusive {
            return Ok(Vec::new());
        }
        Ok(state
            .blocks
            .range(from_exclusive + 1..=to_inclusive)
            .map(|(_, block)| block.clone())
            .collect())
    }

    async fn get_logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
    ) -> ProviderResult<Vec<ChainLog>> {
        let mut state = self.state();
        Self::check(&mut state, "get_logs_in_range", None)?;
        let mut logs: Vec<ChainLog> = state
            .logs
            .iter()
            .filter(|log| log.block_number >= from_block && log.block_number <= to_block)
            .filter(|log| addresses.is_empty() || addresses.contains(&log.address))
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn get_balance(&self, address: Address, block: u64) -> ProviderResult<Decimal> {
        let mut state = self.state();
        Self::check(&mut state, "get_balance", None)?;
        if let Some(value) = state.block_balances.get(&(address, block)) {
            return Ok(*value);
        }
        Ok(state.balances.get(&address).copied().unwrap_or(Decimal::ZERO))
    }

    async fn get_contract_scalar(
        &self,
        contract: Address,
        call: &ContractCall,
        block: u64,
    ) -> ProviderResult<U256> {
        let mut state = self.state();
        Self::check(&mut state, "get_contract_scalar", Some(call.signature))?;
        let key = (contract, call.signature, call.output_index);
        if let Some(value) = state.block_scalars.get(&(key, block)) {
            return Ok(*value);
        }
        state
            .scalars
            .get(&key)
            .copied()
            .ok_or_else(|| ProviderError::Rpc(format!("execution reverted: {} on {}", call.signature, contract)))
    }

    async fn get_transaction_history(&self, address: Address, since_block: u64) -> ProviderResult<Vec<ChainTransaction>> {
        let mut state = self.state();
        Self::check(&mut state, "get_transaction_history", None)?;
        Ok(state
            .history
            .get(&address)
            .map(|txs| {
                txs.iter()
                    .filter(|tx| tx.block_number >= since_block)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Encode a typed event into a raw log, as a node would return it.
///
/// Logs of the same block share one transaction hash unless the caller
/// overwrites `transaction_hash`.
///
/// # Arguments
/// * `address` - Emitting contract
/// * `event` - The event to encode
/// * `block_number` - Block the log belongs to
/// * `log_index` - Position of the log in the block
pub fn encode_event<E: SolEvent>(address: Address, event: &E, block_number: u64, log_index: u64) -> ChainLog {
    let data = event.encode_log_data();
    ChainLog {
        address,
        topics: data.topics().to_vec(),
        data: data.data,
        block_number,
        log_index,
        transaction_hash: Some(B256::left_padding_from(&block_number.to_be_bytes())),
    }
}
