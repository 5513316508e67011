//! Agent configuration.
//!
//! Every field has a mainnet default, so an empty JSON object is a valid
//! config file. Amount thresholds are in ether (or stETH/wstETH) units;
//! duration thresholds are in seconds.

use alloy::primitives::{address, Address};
use bigdecimal::BigDecimal;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use steth_monitor_heuristics::{Severity, ThresholdConfig};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must not be the zero address")]
    ZeroAddress(&'static str),
    #[error("{0} must define at least one threshold tier")]
    EmptyTiers(&'static str),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}

fn tier(alert_id: &str, threshold: Decimal, cooldown_secs: u64, severity: Severity) -> ThresholdConfig {
    ThresholdConfig {
        alert_id: alert_id.to_string(),
        threshold,
        cooldown_secs,
        severity,
    }
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub steth: StethConfig,
    pub withdrawals: WithdrawalsConfig,
    pub gate_seal: GateSealConfig,
    pub bridge: BridgeConfig,
}

impl AgentsConfig {
    /// Load and validate the config.
    ///
    /// # Arguments
    /// * `path` - JSON file to read; defaults are used when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.steth.validate()?;
        self.withdrawals.validate()?;
        self.gate_seal.validate()?;
        self.bridge.validate()
    }
}

fn non_zero(address: Address, field: &'static str) -> Result<(), ConfigError> {
    if address == Address::ZERO {
        return Err(ConfigError::ZeroAddress(field));
    }
    Ok(())
}

fn positive(value: u64, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive(field));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StethConfig {
    pub lido: Address,
    pub withdrawal_queue: Address,
    pub deposit_security_module: Address,
    pub deposit_executor: Address,
    pub insurance_fund: Address,
    /// Allowed share rate change between blocks, in units of the 1e27-scaled rate.
    pub share_rate_epsilon: BigDecimal,
    pub depositor_history_lookback_blocks: u64,
    /// Buffered ether is checked this many blocks behind the head.
    pub buffered_eth_lag_blocks: u64,
    pub high_depositable_eth: ThresholdConfig,
    pub huge_depositable_eth: ThresholdConfig,
    pub max_depositor_idle_secs: u64,
    pub huge_depositable_min_duration_secs: u64,
    pub deposit_executor_balance: ThresholdConfig,
    /// Tiers over `currentStakeLimit / maxStakeLimit`.
    pub staking_limit: Vec<ThresholdConfig>,
}

impl Default for StethConfig {
    fn default() -> Self {
        Self {
            lido: address!("ae7ab96520de3a18e5e111b5eaab095312d7fe84"),
            withdrawal_queue: address!("889edc2edab5f40e902b864ad4d7ade8e412f9b1"),
            deposit_security_module: address!("ffa96d84def2ea035c7ab153d8b991128e3d72fd"),
            deposit_executor: address!("f82ac5937a20dc862f9bc0668779031e06000f17"),
            insurance_fund: address!("8b3f33234abd88493c0cd28de33d583b70bede35"),
            share_rate_epsilon: BigDecimal::from(1u64),
            depositor_history_lookback_blocks: 3 * 7_200,
            buffered_eth_lag_blocks: 3,
            high_depositable_eth: tier("HIGH-DEPOSITABLE-ETH", Decimal::from(10_000), DAY, Severity::Medium),
            huge_depositable_eth: tier("HUGE-DEPOSITABLE-ETH", Decimal::from(20_000), DAY, Severity::High),
            max_depositor_idle_secs: 3 * DAY,
            huge_depositable_min_duration_secs: HOUR,
            deposit_executor_balance: tier("LOW-DEPOSIT-EXECUTOR-BALANCE", Decimal::from(2), DAY, Severity::Medium),
            staking_limit: vec![
                tier("LOW-STAKING-LIMIT", Decimal::new(1, 1), 12 * HOUR, Severity::Medium),
                tier("LOW-STAKING-LIMIT", Decimal::new(3, 1), 12 * HOUR, Severity::Info),
            ],
        }
    }
}

impl StethConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.lido, "steth.lido")?;
        non_zero(self.withdrawal_queue, "steth.withdrawal_queue")?;
        non_zero(self.deposit_security_module, "steth.deposit_security_module")?;
        non_zero(self.deposit_executor, "steth.deposit_executor")?;
        non_zero(self.insurance_fund, "steth.insurance_fund")?;
        positive(self.buffered_eth_lag_blocks, "steth.buffered_eth_lag_blocks")?;
        if self.staking_limit.is_empty() {
            return Err(ConfigError::EmptyTiers("steth.staking_limit"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalsConfig {
    pub withdrawal_queue: Address,
    /// Threshold in stETH.
    pub big_unfinalized_queue: ThresholdConfig,
    /// Threshold in seconds of waiting.
    pub long_unfinalized_queue: ThresholdConfig,
    pub claimed_retention_secs: u64,
    pub init_lookback_blocks: u64,
}

impl Default for WithdrawalsConfig {
    fn default() -> Self {
        Self {
            withdrawal_queue: address!("889edc2edab5f40e902b864ad4d7ade8e412f9b1"),
            big_unfinalized_queue: tier(
                "WITHDRAWALS-BIG-UNFINALIZED-QUEUE",
                Decimal::from(100_000),
                DAY,
                Severity::Medium,
            ),
            long_unfinalized_queue: tier(
                "WITHDRAWALS-LONG-UNFINALIZED-QUEUE",
                Decimal::from(5 * DAY),
                DAY,
                Severity::Medium,
            ),
            claimed_retention_secs: DAY,
            init_lookback_blocks: 14 * 7_200,
        }
    }
}

impl WithdrawalsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.withdrawal_queue, "withdrawals.withdrawal_queue")?;
        positive(self.init_lookback_blocks, "withdrawals.init_lookback_blocks")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSealConfig {
    pub gate_seal: Address,
    pub gate_seal_factory: Address,
    pub withdrawal_queue: Address,
    pub exit_bus_oracle: Address,
    /// Tiers over seconds remaining until expiry.
    pub expiry: Vec<ThresholdConfig>,
    pub pause_role_cooldown_secs: u64,
}

impl Default for GateSealConfig {
    fn default() -> Self {
        Self {
            gate_seal: address!("79243345edbe01a7e42edff5900156700d22611c"),
            gate_seal_factory: address!("6c82877cac5a7a739f16ca0a89c0a328b8764a24"),
            withdrawal_queue: address!("889edc2edab5f40e902b864ad4d7ade8e412f9b1"),
            exit_bus_oracle: address!("0de4ea0184c2ad0baca7183356aea5b8d5bf5c6e"),
            expiry: vec![
                tier("GATE-SEAL-IS-EXPIRED", Decimal::ZERO, DAY, Severity::High),
                tier(
                    "GATE-SEAL-IS-ABOUT-TO-BE-EXPIRED",
                    Decimal::from(4 * 7 * DAY),
                    DAY,
                    Severity::Medium,
                ),
            ],
            pause_role_cooldown_secs: DAY,
        }
    }
}

impl GateSealConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.gate_seal, "gate_seal.gate_seal")?;
        non_zero(self.gate_seal_factory, "gate_seal.gate_seal_factory")?;
        non_zero(self.withdrawal_queue, "gate_seal.withdrawal_queue")?;
        non_zero(self.exit_bus_oracle, "gate_seal.exit_bus_oracle")?;
        if self.expiry.is_empty() {
            return Err(ConfigError::EmptyTiers("gate_seal.expiry"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// L2 name used in finding titles.
    pub network_name: String,
    pub l1_bridge: Address,
    pub l1_wsteth: Address,
    pub l2_token_bridge: Address,
    pub l2_wsteth: Address,
    pub withdrawals_window_secs: u64,
    /// Threshold in wstETH summed over the window.
    pub huge_withdrawals: ThresholdConfig,
    /// Window findings are only raised on blocks divisible by this.
    pub report_every_blocks: u64,
    /// Used to size the startup lookback from the window.
    pub l2_block_time_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            network_name: "Mantle".to_string(),
            l1_bridge: address!("2d001d79e5af5f65a939781fe228b267a8ed468b"),
            l1_wsteth: address!("7f39c581f595b53c5cb19bd0b3f8da6c935e2ca0"),
            l2_token_bridge: address!("9c46560d6209743968cc24150893631a39afde4d"),
            l2_wsteth: address!("458ed78eb972a369799fb278c0243b25e5242a83"),
            withdrawals_window_secs: 2 * DAY,
            huge_withdrawals: tier("HUGE-WITHDRAWALS-FROM-L2", Decimal::from(10_000), HOUR, Severity::Medium),
            report_every_blocks: 10,
            l2_block_time_secs: 13,
        }
    }
}

impl BridgeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.l1_bridge, "bridge.l1_bridge")?;
        non_zero(self.l1_wsteth, "bridge.l1_wsteth")?;
        non_zero(self.l2_token_bridge, "bridge.l2_token_bridge")?;
        non_zero(self.l2_wsteth, "bridge.l2_wsteth")?;
        positive(self.withdrawals_window_secs, "bridge.withdrawals_window_secs")?;
        positive(self.report_every_blocks, "bridge.report_every_blocks")?;
        positive(self.l2_block_time_secs, "bridge.l2_block_time_secs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AgentsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentsConfig = serde_json::from_str(
            r#"{ "bridge": { "network_name": "Linea", "withdrawals_window_secs": 3600 } }"#,
        )
        .unwrap();

        assert_eq!(config.bridge.network_name, "Linea");
        assert_eq!(config.bridge.withdrawals_window_secs, 3_600);
        assert_eq!(config.bridge.report_every_blocks, 10);
        assert_eq!(config.steth.lido, StethConfig::default().lido);
    }

    #[test]
    fn test_zero_window_rejected() {
        let config: AgentsConfig =
            serde_json::from_str(r#"{ "bridge": { "withdrawals_window_secs": 0 } }"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive("bridge.withdrawals_window_secs"))
        ));
    }

    #[test]
    fn test_zero_address_rejected() {
        let config: AgentsConfig = serde_json::from_str(
            r#"{ "steth": { "lido": "0x0000000000000000000000000000000000000000" } }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ZeroAddress("steth.lido"))));
    }

    #[test]
    fn test_malformed_address_fails_to_parse() {
        let parsed: Result<AgentsConfig, _> = serde_json::from_str(r#"{ "steth": { "lido": "0x1234" } }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_threshold_tiers_parse() {
        let config: AgentsConfig = serde_json::from_str(
            r#"{ "steth": { "staking_limit": [
                { "alert_id": "LOW-STAKING-LIMIT", "threshold": 0.05, "cooldown_secs": 60, "severity": "High" }
            ] } }"#,
        )
        .unwrap();
        assert_eq!(config.steth.staking_limit.len(), 1);
        assert_eq!(config.steth.staking_limit[0].threshold, Decimal::new(5, 2));
        assert_eq!(config.steth.staking_limit[0].severity, Severity::High);
    }

    #[test]
    fn test_empty_tiers_rejected() {
        let config: AgentsConfig = serde_json::from_str(r#"{ "gate_seal": { "expiry": [] } }"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyTiers("gate_seal.expiry"))));
    }
}
