//! Chain data provider interface for the stETH monitoring agents.
//!
//! Agents never talk to a node directly. Everything they read from the
//! execution layer (blocks, logs, balances, contract state) goes through the
//! [`ChainProvider`] trait so that the JSON-RPC client and the in-memory
//! fixture used by tests can be swapped without touching detection code.

pub mod fixture;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use num_bigint::{BigInt, Sign};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Error type for chain provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider not available: {0}")]
    NotAvailable(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("Block not found: {0}")]
    BlockNotFound(u64),
    #[error("Network error: {0}")]
    Network(#[from] anyhow::Error),
}

/// Result type for chain provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Header-level view of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block number.
    pub number: u64,
    /// Block timestamp in unix seconds.
    pub timestamp: u64,
    pub parent_hash: Option<B256>,
    pub hash: Option<B256>,
}

impl BlockRef {
    pub fn new(number: u64, timestamp: u64) -> Self {
        Self {
            number,
            timestamp,
            parent_hash: None,
            hash: None,
        }
    }
}

/// A raw log as delivered by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<B256>,
}

/// A transaction touching a watched contract, with the logs it emitted.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub hash: B256,
    pub to: Option<Address>,
    pub block: BlockRef,
    pub logs: Vec<ChainLog>,
}

impl TransactionEvent {
    /// Addresses involved in the transaction: the recipient and every log emitter.
    pub fn addresses(&self) -> BTreeSet<Address> {
        let mut addresses: BTreeSet<Address> = self.logs.iter().map(|log| log.address).collect();
        if let Some(to) = self.to {
            addresses.insert(to);
        }
        addresses
    }
}

/// A historical transaction sent to or from an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub block_number: u64,
    pub timestamp: u64,
}

/// A read-only contract call returning a single 32-byte word.
///
/// Multi-value getters are addressed by `output_index`, the position of the
/// word in the ABI-encoded return data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub signature: &'static str,
    pub args: Vec<B256>,
    pub output_index: usize,
}

impl ContractCall {
    /// Create a call with no arguments reading the first output word.
    pub fn new(signature: &'static str) -> Self {
        Self {
            signature,
            args: Vec::new(),
            output_index: 0,
        }
    }

    pub fn arg_address(mut self, address: Address) -> Self {
        self.args.push(address.into_word());
        self
    }

    pub fn arg_uint(mut self, value: U256) -> Self {
        self.args.push(B256::from(value.to_be_bytes::<32>()));
        self
    }

    pub fn arg_word(mut self, word: B256) -> Self {
        self.args.push(word);
        self
    }

    /// Select which return word to read.
    pub fn output(mut self, index: usize) -> Self {
        self.output_index = index;
        self
    }

    /// ABI calldata: the 4-byte selector followed by the argument words.
    pub fn calldata(&self) -> Bytes {
        let selector = keccak256(self.signature.as_bytes());
        let mut data = Vec::with_capacity(4 + 32 * self.args.len());
        data.extend_from_slice(&selector[..4]);
        for arg in &self.args {
            data.extend_from_slice(arg.as_slice());
        }
        Bytes::from(data)
    }
}

/// Convert an on-chain integer into an exact decimal.
///
/// # Arguments
/// * `value` - Raw uint256 value (usually wei)
///
/// # Returns
/// The decimal value, or a decode error if it exceeds the decimal range.
pub fn u256_to_decimal(value: U256) -> ProviderResult<Decimal> {
    Decimal::from_str(&value.to_string())
        .map_err(|e| ProviderError::Decode(format!("value {} out of range: {}", value, e)))
}

/// Convert an on-chain integer into an arbitrary-precision decimal.
///
/// Every uint256 fits, so ratios and deltas over raw values stay exact.
pub fn u256_to_big(value: U256) -> BigDecimal {
    let digits = BigInt::from_bytes_be(Sign::Plus, &value.to_be_bytes::<32>());
    BigDecimal::new(digits, 0)
}

/// Trait for execution layer data sources.
///
/// Implementations must be safe to share between agents. Every method is a
/// plain read; retries and timeouts are the implementation's concern.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Get the latest block header.
    async fn get_latest_block(&self) -> ProviderResult<BlockRef>;

    /// Get block headers in `(from_exclusive, to_inclusive]`.
    ///
    /// # Arguments
    /// * `from_exclusive` - Last block already known to the caller
    /// * `to_inclusive` - Last block to fetch
    ///
    /// # Returns
    /// Headers in ascending order.
    async fn get_blocks_in_range(&self, from_exclusive: u64, to_inclusive: u64) -> ProviderResult<Vec<BlockRef>>;

    /// Get logs emitted in `[from_block, to_block]`.
    ///
    /// # Arguments
    /// * `from_block` - First block, inclusive
    /// * `to_block` - Last block, inclusive
    /// * `addresses` - Emitters to include; empty means all
    async fn get_logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
    ) -> ProviderResult<Vec<ChainLog>>;

    /// Get the native balance of an account at a block, in wei.
    async fn get_balance(&self, address: Address, block: u64) -> ProviderResult<Decimal>;

    /// Execute a read-only call and return the selected raw output word.
    async fn get_contract_scalar(
        &self,
        contract: Address,
        call: &ContractCall,
        block: u64,
    ) -> ProviderResult<U256>;

    /// Get transactions of an account since a block, oldest first.
    async fn get_transaction_history(&self, address: Address, since_block: u64) -> ProviderResult<Vec<ChainTransaction>>;
}
