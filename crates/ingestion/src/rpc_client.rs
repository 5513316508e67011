//! Ethereum JSON-RPC client implementing [`ChainProvider`].

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use steth_monitor_provider::{
    u256_to_decimal, BlockRef, ChainLog, ChainProvider, ChainTransaction, ContractCall, ProviderError, ProviderResult,
};
use steth_monitor_telemetry::Metrics;
use tokio::time::Instant;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Etherscan-compatible account API used for transaction history.
#[derive(Debug, Clone)]
pub struct EtherscanConfig {
    pub api_url: String,
    pub api_key: String,
}

/// Ethereum RPC client wrapper.
pub struct RpcClient {
    client: Client,
    rpc_url: String,
    etherscan: Option<EtherscanConfig>,
    metrics: Metrics,
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtherscanTx {
    hash: String,
    from: String,
    #[serde(default)]
    to: String,
    block_number: String,
    time_stamp: String,
}

impl RpcClient {
    /// Create a new RPC client.
    ///
    /// # Arguments
    /// * `rpc_url` - HTTP/HTTPS JSON-RPC endpoint URL
    /// * `metrics` - Metrics collector
    pub fn new(rpc_url: &str, metrics: Metrics) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        info!("Initialized RPC client for {}", rpc_url);

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            etherscan: None,
            metrics,
        })
    }

    /// Enable transaction history lookups through an Etherscan-compatible API.
    pub fn with_etherscan(mut self, etherscan: EtherscanConfig) -> Self {
        self.etherscan = Some(etherscan);
        self
    }

    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self.client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("RPC request failed with status: {}", response.status()));
        }

        let result: Value = response.json().await?;

        // Check for RPC error
        if let Some(error) = result.get("error") {
            return Err(anyhow::anyhow!("RPC error: {}", error));
        }

        Ok(result["result"].clone())
    }

    /// Call and record latency under `operation`.
    async fn timed_call(&self, operation: &str, method: &str, params: Value) -> ProviderResult<Value> {
        let start = Instant::now();
        let result = self.call_rpc(method, params).await;
        self.metrics.observe_rpc_latency(operation, start.elapsed().as_secs_f64());
        Ok(result?)
    }

    async fn get_block_by_number(&self, tag: Value) -> ProviderResult<Option<BlockRef>> {
        let result = self.timed_call("get_block", "eth_getBlockByNumber", json!([tag, false])).await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_block(&result).map(Some)
    }
}

fn hex_block(number: u64) -> String {
    format!("0x{:x}", number)
}

fn parse_hex_u64(value: &Value, field: &str) -> ProviderResult<u64> {
    let hex_str = value
        .as_str()
        .ok_or_else(|| ProviderError::Decode(format!("{} is not a string", field)))?;
    u64::from_str_radix(hex_str.strip_prefix("0x").unwrap_or(hex_str), 16)
        .map_err(|e| ProviderError::Decode(format!("{}: {}", field, e)))
}

fn parse_hex_u256(value: &Value, field: &str) -> ProviderResult<U256> {
    let hex_str = value
        .as_str()
        .ok_or_else(|| ProviderError::Decode(format!("{} is not a string", field)))?;
    U256::from_str_radix(hex_str.strip_prefix("0x").unwrap_or(hex_str), 16)
        .map_err(|e| ProviderError::Decode(format!("{}: {}", field, e)))
}

fn parse_hash(value: &Value) -> Option<B256> {
    value.as_str().and_then(|s| B256::from_str(s).ok())
}

fn parse_block(block_json: &Value) -> ProviderResult<BlockRef> {
    Ok(BlockRef {
        number: parse_hex_u64(&block_json["number"], "number")?,
        timestamp: parse_hex_u64(&block_json["timestamp"], "timestamp")?,
        parent_hash: parse_hash(&block_json["parentHash"]),
        hash: parse_hash(&block_json["hash"]),
    })
}

fn into_chain_log(log: Log) -> Option<ChainLog> {
    Some(ChainLog {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number: log.block_number?,
        log_index: log.log_index?,
        transaction_hash: log.transaction_hash,
    })
}

/// Select one 32-byte word out of ABI-encoded return data.
fn output_word(data: &[u8], index: usize) -> ProviderResult<U256> {
    let start = index * 32;
    let word = data
        .get(start..start + 32)
        .ok_or_else(|| ProviderError::Decode(format!("return data too short for word {}", index)))?;
    Ok(U256::from_be_slice(word))
}

fn parse_etherscan_tx(tx: EtherscanTx) -> ProviderResult<ChainTransaction> {
    let decode = |field: &str, e: String| ProviderError::Decode(format!("etherscan {}: {}", field, e));
    Ok(ChainTransaction {
        hash: B256::from_str(&tx.hash).map_err(|e| decode("hash", e.to_string()))?,
        from: Address::from_str(&tx.from).map_err(|e| decode("from", e.to_string()))?,
        to: Address::from_str(&tx.to).ok(),
        block_number: tx.block_number.parse().map_err(|e: std::num::ParseIntError| decode("blockNumber", e.to_string()))?,
        timestamp: tx.time_stamp.parse().map_err(|e: std::num::ParseIntError| decode("timeStamp", e.to_string()))?,
    })
}

#[async_trait]
impl ChainProvider for RpcClient {
    async fn get_latest_block(&self) -> ProviderResult<BlockRef> {
        let block = self
            .get_block_by_number(json!("latest"))
            .await?
            .ok_or_else(|| ProviderError::Rpc("latest block missing".to_string()))?;
        debug!("Latest block number: {}", block.number);
        Ok(block)
    }

    async fn get_blocks_in_range(&self, from_exclusive: u64, to_inclusive: u64) -> ProviderResult<Vec<BlockRef>> {
        let mut blocks = Vec::new();
        for number in from_exclusive.saturating_add(1)..=to_inclusive {
            let block = self
                .get_block_by_number(json!(hex_block(number)))
                .await?
                .ok_or(ProviderError::BlockNotFound(number))?;
            blocks.push(block);
        }
        debug!("Fetched {} blocks in ({}, {}]", blocks.len(), from_exclusive, to_inclusive);
        Ok(blocks)
    }

    async fn get_logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
    ) -> ProviderResult<Vec<ChainLog>> {
        let mut filter = json!({
            "fromBlock": hex_block(from_block),
            "toBlock": hex_block(to_block),
        });
        if !addresses.is_empty() {
            filter["address"] = json!(addresses);
        }

        let result = self.timed_call("get_logs", "eth_getLogs", json!([filter])).await?;
        let logs: Vec<Log> = serde_json::from_value(result)
            .map_err(|e| ProviderError::Decode(format!("logs: {}", e)))?;

        let logs: Vec<ChainLog> = logs.into_iter().filter_map(into_chain_log).collect();
        debug!("Fetched {} logs in [{}, {}]", logs.len(), from_block, to_block);
        Ok(logs)
    }

    async fn get_balance(&self, address: Address, block: u64) -> ProviderResult<Decimal> {
        let result = self
            .timed_call("get_balance", "eth_getBalance", json!([address, hex_block(block)]))
            .await?;
        u256_to_decimal(parse_hex_u256(&result, "balance")?)
    }

    async fn get_contract_scalar(
        &self,
        contract: Address,
        call: &ContractCall,
        block: u64,
    ) -> ProviderResult<U256> {
        let request = json!({ "to": contract, "data": call.calldata() });
        let result = self
            .timed_call("eth_call", "eth_call", json!([request, hex_block(block)]))
            .await?;

        let hex_str = result
            .as_str()
            .ok_or_else(|| ProviderError::Decode(format!("{} returned non-string", call.signature)))?;
        let data = hex::decode(hex_str.strip_prefix("0x").unwrap_or(hex_str))
            .map_err(|e| ProviderError::Decode(format!("{}: {}", call.signature, e)))?;

        output_word(&data, call.output_index)
    }

    async fn get_transaction_history(&self, address: Address, since_block: u64) -> ProviderResult<Vec<ChainTransaction>> {
        let etherscan = self
            .etherscan
            .as_ref()
            .ok_or_else(|| ProviderError::NotAvailable("etherscan API is not configured".to_string()))?;

        let start = Instant::now();
        let response = self
            .client
            .get(&etherscan.api_url)
            .query(&[
                ("module", "account".to_string()),
                ("action", "txlist".to_string()),
                ("address", address.to_string()),
                ("startblock", since_block.to_string()),
                ("endblock", "99999999".to_string()),
                ("sort", "asc".to_string()),
                ("apikey", etherscan.api_key.clone()),
            ])
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        let body: EtherscanResponse = response.json().await.map_err(anyhow::Error::from)?;
        self.metrics.observe_rpc_latency("get_transaction_history", start.elapsed().as_secs_f64());

        if body.status != "1" {
            if body.message.starts_with("No transactions found") {
                return Ok(Vec::new());
            }
            return Err(ProviderError::Rpc(format!("etherscan: {} {}", body.message, body.result)));
        }

        let txs: Vec<EtherscanTx> = serde_json::from_value(body.result)
            .map_err(|e| ProviderError::Decode(format!("etherscan txlist: {}", e)))?;
        txs.into_iter().map(parse_etherscan_tx).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block() {
        let block = parse_block(&json!({
            "number": "0x12a05f2",
            "timestamp": "0x65f1c0a0",
            "hash": "0x1547f17108830a92673b967aff13971fae18b4d35681b93a38a97a22083deb93",
            "parentHash": "0xb00783f3eb79bd60f63e5744bbf0cb4fdc2f98bbca54cd2d3f611f032faa6a57",
        }))
        .unwrap();

        assert_eq!(block.number, 19_531_250);
        assert_eq!(block.timestamp, 0x65f1c0a0);
        assert!(block.hash.is_some());
        assert!(block.parent_hash.is_some());
    }

    #[test]
    fn test_parse_block_rejects_missing_number() {
        assert!(parse_block(&json!({ "timestamp": "0x1" })).is_err());
    }

    #[test]
    fn test_output_word() {
        let mut data = vec![0u8; 96];
        data[63] = 7;
        data[95] = 9;
        assert_eq!(output_word(&data, 1).unwrap(), U256::from(7));
        assert_eq!(output_word(&data, 2).unwrap(), U256::from(9));
        assert!(output_word(&data, 3).is_err());
    }

    #[test]
    fn test_parse_logs_response() {
        let raw = json!([{
            "address": "0x353012dc4a9a6cf55c941badc267f82004a8ceb9",
            "topics": ["0x8b9f8b5d7e2b4e9fd7d83cb5b5d3c5e4a6f0d1c2b3a4958677869504132231ab"],
            "data": "0x",
            "blockNumber": "0x10",
            "blockHash": null,
            "transactionHash": "0x1547f17108830a92673b967aff13971fae18b4d35681b93a38a97a22083deb93",
            "transactionIndex": "0x0",
            "logIndex": "0x3",
            "removed": false
        }]);

        let logs: Vec<Log> = serde_json::from_value(raw).unwrap();
        let logs: Vec<ChainLog> = logs.into_iter().filter_map(into_chain_log).collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 16);
        assert_eq!(logs[0].log_index, 3);
        assert_eq!(logs[0].topics.len(), 1);
    }

    #[test]
    fn test_parse_etherscan_tx() {
        let tx = parse_etherscan_tx(EtherscanTx {
            hash: "0x1547f17108830a92673b967aff13971fae18b4d35681b93a38a97a22083deb93".to_string(),
            from: "0xf82ac5937a20dc862f9bc0668779031e06000f17".to_string(),
            to: String::new(),
            block_number: "19530226".to_string(),
            time_stamp: "1710342304".to_string(),
        })
        .unwrap();

        assert_eq!(tx.block_number, 19_530_226);
        assert_eq!(tx.timestamp, 1_710_342_304);
        assert!(tx.to.is_none());
    }
}
