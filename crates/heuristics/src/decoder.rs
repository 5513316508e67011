//! Typed event extraction from raw logs.

use alloy::primitives::{Address, B256};
use alloy::sol_types::SolEvent;
use steth_monitor_provider::ChainLog;
use tracing::debug;

/// A decoded event together with where it was emitted.
#[derive(Debug, Clone)]
pub struct DecodedEvent<E> {
    pub event: E,
    pub address: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<B256>,
}

/// Decode a single log as event `E`.
pub fn decode_log<E: SolEvent>(log: &ChainLog) -> alloy::sol_types::Result<E> {
    E::decode_raw_log(log.topics.iter().copied(), &log.data, true)
}

/// Extract every `E` emitted by `address`.
///
/// # Arguments
/// * `logs` - Raw logs in any order
/// * `address` - Emitter to match
///
/// # Returns
/// Decoded events in `(block_number, log_index)` order. Logs whose topic
/// matches but whose payload does not decode are skipped.
pub fn filter_logs<E: SolEvent>(logs: &[ChainLog], address: Address) -> Vec<DecodedEvent<E>> {
    let mut matching: Vec<&ChainLog> = logs
        .iter()
        .filter(|log| log.address == address && log.topics.first() == Some(&E::SIGNATURE_HASH))
        .collect();
    matching.sort_by_key(|log| (log.block_number, log.log_index));

    matching
        .into_iter()
        .filter_map(|log| match decode_log::<E>(log) {
            Ok(event) => Some(DecodedEvent {
                event,
                address: log.address,
                block_number: log.block_number,
                log_index: log.log_index,
                transaction_hash: log.transaction_hash,
            }),
            Err(e) => {
                debug!(
                    "Skipping undecodable {} log at block {} index {}: {}",
                    E::SIGNATURE,
                    log.block_number,
                    log.log_index,
                    e
                );
                None
            }
        })
        .collect()
}
