use alloy::primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use std::sync::Arc;
use steth_monitor_agents::config::GateSealConfig;
use steth_monitor_agents::events::{GateSealCreated, Sealed};
use steth_monitor_agents::{Agent, GateSealAgent};
use steth_monitor_heuristics::format::etherscan_address;
use steth_monitor_heuristics::{FindingType, Severity};
use steth_monitor_provider::fixture::{encode_event, FixtureProvider};
use steth_monitor_provider::{BlockRef, TransactionEvent};

/// Wed, 01 May 2024 00:00:00 GMT
const NOW: u64 = 1_714_521_600;
const DAY: u64 = 86_400;

fn setup(expiry: u64) -> (GateSealConfig, Arc<FixtureProvider>, GateSealAgent) {
    let config = GateSealConfig::default();
    let provider = Arc::new(FixtureProvider::new());
    provider.set_scalar(config.gate_seal, "get_expiry_timestamp()", Decimal::from(expiry));
    provider.set_scalar(config.withdrawal_queue, "hasRole(bytes32,address)", Decimal::ONE);
    provider.set_scalar(config.exit_bus_oracle, "hasRole(bytes32,address)", Decimal::ONE);
    let agent = GateSealAgent::new(provider.clone(), config.clone());
    (config, provider, agent)
}

fn block() -> BlockRef {
    BlockRef::new(19_770_000, NOW)
}

#[tokio::test]
async fn test_far_expiry_is_quiet() {
    let (_, _, mut agent) = setup(NOW + 365 * DAY);
    assert!(agent.handle_block(&block()).await.is_empty());
}

#[tokio::test]
async fn test_about_to_expire() {
    let (config, _, mut agent) = setup(NOW + 10 * DAY);

    let findings = agent.handle_block(&block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].alert_id, "GATE-SEAL-IS-ABOUT-TO-BE-EXPIRED");
    assert_eq!(findings[0].name, "⚠️ GateSeal: is about to be expired");
    assert_eq!(
        findings[0].description,
        format!(
            "GateSeal address: {}\nExpiry date Sat, 11 May 2024 00:00:00 GMT",
            etherscan_address(config.gate_seal)
        )
    );
    assert_eq!(findings[0].severity, Severity::Medium);
    assert_eq!(findings[0].finding_type, FindingType::Degraded);

    // one report per day
    let next = BlockRef::new(19_770_001, NOW + 12);
    assert!(agent.handle_block(&next).await.is_empty());
}

#[tokio::test]
async fn test_expired() {
    let (_, _, mut agent) = setup(NOW - 1);

    let findings = agent.handle_block(&block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].alert_id, "GATE-SEAL-IS-EXPIRED");
    assert_eq!(findings[0].name, "🚨 GateSeal: is expired!");
    assert_eq!(findings[0].severity, Severity::High);
}

#[tokio::test]
async fn test_missing_pause_role() {
    let (config, provider, mut agent) = setup(NOW + 365 * DAY);
    provider.set_scalar(config.withdrawal_queue, "hasRole(bytes32,address)", Decimal::ZERO);

    let findings = agent.handle_block(&block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].alert_id, "GATE-SEAL-MISSING-PAUSE-ROLE");
    assert_eq!(findings[0].severity, Severity::High);
    assert_eq!(findings[0].finding_type, FindingType::Degraded);
    assert!(findings[0].description.contains("WithdrawalQueue"));
    assert!(!findings[0].description.contains("ValidatorsExitBusOracle"));
}

#[tokio::test]
async fn test_expiry_failure_keeps_role_check() {
    let (config, provider, mut agent) = setup(NOW + 365 * DAY);
    provider.fail("get_expiry_timestamp()");
    provider.set_scalar(config.exit_bus_oracle, "hasRole(bytes32,address)", Decimal::ZERO);

    let findings = agent.handle_block(&block()).await;
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].alert_id, "NETWORK-ERROR");
    assert_eq!(findings[0].description, "Could not call provider.get_expiry_timestamp()");
    assert_eq!(findings[1].alert_id, "GATE-SEAL-MISSING-PAUSE-ROLE");
}

#[tokio::test]
async fn test_seal_and_factory_events() {
    let (config, _, mut agent) = setup(NOW + 365 * DAY);
    let created = encode_event(
        config.gate_seal_factory,
        &GateSealCreated {
            gate_seal: Address::repeat_byte(0x42),
        },
        19_770_000,
        0,
    );
    let sealed = encode_event(
        config.gate_seal,
        &Sealed {
            gate_seal: config.gate_seal,
            sealed_by: Address::repeat_byte(0x01),
            sealed_for: U256::from(6 * DAY),
            sealable: config.withdrawal_queue,
            sealed_until: U256::from(NOW + 6 * DAY),
        },
        19_770_000,
        1,
    );
    let tx = TransactionEvent {
        hash: B256::repeat_byte(9),
        to: Some(config.gate_seal),
        block: block(),
        logs: vec![sealed, created],
    };

    let findings = agent.handle_transaction(&tx).await;
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].alert_id, "GATE-SEAL-NEW-ONE-CREATED");
    assert!(findings[0]
        .description
        .starts_with(&format!("New instance address: {}", etherscan_address(Address::repeat_byte(0x42)))));
    assert_eq!(findings[1].alert_id, "GATE-SEAL-TRIGGERED");
    assert_eq!(findings[1].severity, Severity::Critical);
    assert!(findings[1].description.contains("Sealed for: 144 hrs"));
    assert!(findings[1].description.contains("Sealed until: Tue, 07 May 2024 00:00:00 GMT"));
}
