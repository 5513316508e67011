use alloy::primitives::{Address, Bytes, B256, U256};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use steth_monitor_agents::bridge::{withdrawal_records, WithdrawalsWindowMonitor};
use steth_monitor_agents::config::BridgeConfig;
use steth_monitor_agents::events::{
    BridgingInitiated, DepositsDisabled, RoleGranted, WithdrawalInitiated, BRIDGE_ROLES,
};
use steth_monitor_agents::{Agent, BridgeAgent};
use steth_monitor_heuristics::format::from_ether;
use steth_monitor_heuristics::{EventRecord, Severity};
use steth_monitor_provider::fixture::{encode_event, FixtureProvider};
use steth_monitor_provider::{BlockRef, ChainLog, TransactionEvent};

const L2_START: u64 = 1_714_521_600;
const L1_BLOCK: u64 = 20_000_000;

fn ether(amount: i64) -> Decimal {
    from_ether(Decimal::from(amount))
}

fn wei(amount: i64) -> U256 {
    U256::from_str(&ether(amount).to_string()).unwrap()
}

fn l2_time(number: u64) -> u64 {
    L2_START + (number - 1_000) * 12
}

fn l1_block() -> BlockRef {
    BlockRef::new(L1_BLOCK, L2_START + 600)
}

fn bridging(config: &BridgeConfig, token: Address, amount: i64, block: u64, log_index: u64) -> ChainLog {
    encode_event(
        config.l2_token_bridge,
        &BridgingInitiated {
            sender: Address::repeat_byte(1),
            recipient: Address::repeat_byte(1),
            token,
            amount: wei(amount),
        },
        block,
        log_index,
    )
}

fn withdrawal(config: &BridgeConfig, amount: i64, block: u64, log_index: u64) -> ChainLog {
    encode_event(
        config.l2_token_bridge,
        &WithdrawalInitiated {
            _l1Token: config.l1_wsteth,
            _l2Token: config.l2_wsteth,
            _from: Address::repeat_byte(2),
            _to: Address::repeat_byte(2),
            _amount: wei(amount),
            _data: Bytes::new(),
        },
        block,
        log_index,
    )
}

fn record(time: u64, amount: i64, block_number: u64) -> EventRecord {
    EventRecord {
        time,
        amount: ether(amount),
        block_number,
        log_index: 0,
    }
}

struct Setup {
    config: BridgeConfig,
    l1: Arc<FixtureProvider>,
    l2: Arc<FixtureProvider>,
    agent: BridgeAgent,
}

fn setup() -> Setup {
    let config = BridgeConfig::default();
    let l1 = Arc::new(FixtureProvider::new());
    l1.set_scalar(config.l1_wsteth, "balanceOf(address)", ether(50_000));
    let l2 = Arc::new(FixtureProvider::new());
    l2.push_blocks(1_000, 1_010, L2_START);
    l2.set_scalar(config.l2_wsteth, "totalSupply()", ether(40_000));
    let agent = BridgeAgent::new(l1.clone(), l2.clone(), config.clone());
    Setup { config, l1, l2, agent }
}

#[test]
fn test_window_reports_on_reporting_blocks_only() {
    let config = BridgeConfig::default();
    let mut monitor = WithdrawalsWindowMonitor::new(&config);
    monitor.record([record(l2_time(1_000), 7_000, 1_000), record(l2_time(1_001), 5_000, 1_001)]);

    assert!(monitor.evaluate(&BlockRef::new(1_005, l2_time(1_005))).is_none());

    let finding = monitor.evaluate(&BlockRef::new(1_010, l2_time(1_010))).unwrap();
    assert_eq!(finding.alert_id, "HUGE-WITHDRAWALS-FROM-L2");
    assert_eq!(finding.name, "⚠️ Mantle: Huge withdrawals during the last 48 hour(s)");
    assert_eq!(
        finding.description,
        "There were withdrawals requests from L2 to L1 for the 12000.0000 wstETH in total"
    );
    assert_eq!(finding.severity, Severity::Medium);
    assert!(finding.unique_key.is_some());

    // reported volume is not reported again
    assert!(monitor.window().is_empty());
    assert!(monitor.evaluate(&BlockRef::new(1_020, l2_time(1_020))).is_none());
}

#[test]
fn test_window_threshold_is_inclusive() {
    let config = BridgeConfig::default();
    let mut monitor = WithdrawalsWindowMonitor::new(&config);
    monitor.record([record(l2_time(1_000), 9_999, 1_000)]);
    assert!(monitor.evaluate(&BlockRef::new(1_010, l2_time(1_010))).is_none());

    monitor.record([record(l2_time(1_011), 1, 1_011)]);
    assert!(monitor.evaluate(&BlockRef::new(1_020, l2_time(1_020))).is_some());
}

#[test]
fn test_window_period_and_cooldown() {
    let config = BridgeConfig::default();
    let mut monitor = WithdrawalsWindowMonitor::new(&config);
    let first = BlockRef::new(1_010, l2_time(1_010));
    monitor.record([record(first.timestamp, 20_000, 1_010)]);
    assert!(monitor.evaluate(&first).is_some());

    let soon = first.timestamp + 1_200;
    monitor.record([record(soon, 20_000, 1_110)]);
    assert!(monitor.evaluate(&BlockRef::new(1_110, soon)).is_none());

    let hour_later = first.timestamp + 3_600;
    let finding = monitor.evaluate(&BlockRef::new(1_310, hour_later)).unwrap();
    assert_eq!(finding.name, "⚠️ Mantle: Huge withdrawals during the last 1 hour(s)");
}

#[test]
fn test_window_counts_withdrawals_up_to_the_block() {
    let config = BridgeConfig::default();
    let mut monitor = WithdrawalsWindowMonitor::new(&config);
    monitor.record([
        record(l2_time(1_005), 12_000, 1_005),
        record(l2_time(1_015), 3_000, 1_015),
    ]);

    let finding = monitor.evaluate(&BlockRef::new(1_010, l2_time(1_010))).unwrap();
    assert_eq!(
        finding.description,
        "There were withdrawals requests from L2 to L1 for the 12000.0000 wstETH in total"
    );
    // the later withdrawal was neither counted nor dropped
    assert_eq!(monitor.window().len(), 1);
    assert_eq!(monitor.window().aggregate().sum, ether(3_000));
}

#[test]
fn test_window_prunes_old_withdrawals() {
    let config = BridgeConfig::default();
    let window = config.withdrawals_window_secs;
    let mut monitor = WithdrawalsWindowMonitor::new(&config);
    monitor.record([record(L2_START, 50_000, 1_000)]);

    assert!(monitor.evaluate(&BlockRef::new(50_000, L2_START + window + 1)).is_none());
    assert!(monitor.window().is_empty());
}

#[test]
fn test_withdrawal_records_filter_token() {
    let config = BridgeConfig::default();
    let logs = vec![
        bridging(&config, config.l2_wsteth, 6_000, 1_002, 0),
        bridging(&config, Address::repeat_byte(7), 9_000, 1_002, 1),
        withdrawal(&config, 5_000, 1_004, 0),
    ];
    let blocks = vec![BlockRef::new(1_002, l2_time(1_002)), BlockRef::new(1_004, l2_time(1_004))];

    let records = withdrawal_records(&logs, &blocks, &config);
    let amounts: Vec<Decimal> = records.iter().map(|r| r.amount).collect();
    assert_eq!(amounts, vec![ether(6_000), ether(5_000)]);
    assert_eq!(records[1].time, l2_time(1_004));

    // withdrawals in blocks without a timestamp are skipped
    assert_eq!(withdrawal_records(&logs, &blocks[..1], &config).len(), 1);
}

#[tokio::test]
async fn test_initialize_then_report_huge_withdrawals() {
    let mut s = setup();
    s.l2.push_log(bridging(&s.config, s.config.l2_wsteth, 6_000, 1_002, 0));
    s.l2.push_log(withdrawal(&s.config, 5_000, 1_004, 0));

    assert!(s.agent.initialize(&l1_block()).await.is_empty());
    assert_eq!(s.agent.withdrawals().window().aggregate().sum, ether(11_000));

    s.l2.push_blocks(1_011, 1_020, l2_time(1_011));
    let findings = s.agent.handle_block(&l1_block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].alert_id, "HUGE-WITHDRAWALS-FROM-L2");
    assert_eq!(findings[0].metadata.get("l2_block").map(String::as_str), Some("1020"));
}

#[tokio::test]
async fn test_new_withdrawals_are_tracked() {
    let mut s = setup();
    assert!(s.agent.initialize(&l1_block()).await.is_empty());
    assert!(s.agent.withdrawals().window().is_empty());

    s.l2.push_blocks(1_011, 1_015, l2_time(1_011));
    s.l2.push_log(bridging(&s.config, s.config.l2_wsteth, 3_000, 1_013, 0));
    assert!(s.agent.handle_block(&l1_block()).await.is_empty());
    assert_eq!(s.agent.withdrawals().window().aggregate().sum, ether(3_000));
}

#[tokio::test]
async fn test_batch_withdrawals_wait_for_their_block() {
    let mut s = setup();
    assert!(s.agent.initialize(&l1_block()).await.is_empty());

    s.l2.push_blocks(1_011, 1_025, l2_time(1_011));
    s.l2.push_log(bridging(&s.config, s.config.l2_wsteth, 20_000, 1_022, 0));
    assert!(s.agent.handle_block(&l1_block()).await.is_empty());
    assert_eq!(s.agent.withdrawals().window().aggregate().sum, ether(20_000));

    s.l2.push_blocks(1_026, 1_030, l2_time(1_026));
    let findings = s.agent.handle_block(&l1_block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].alert_id, "HUGE-WITHDRAWALS-FROM-L2");
    assert_eq!(findings[0].metadata.get("l2_block").map(String::as_str), Some("1030"));
}

#[tokio::test]
async fn test_bridge_balance_mismatch() {
    let mut s = setup();
    s.l2.set_scalar(s.config.l2_wsteth, "totalSupply()", ether(60_000));
    assert!(s.agent.initialize(&l1_block()).await.is_empty());
    s.l2.push_blocks(1_011, 1_011, l2_time(1_011));

    let findings = s.agent.handle_block(&l1_block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].alert_id, "BRIDGE-BALANCE-MISMATCH");
    assert_eq!(findings[0].name, "🚨🚨🚨 Mantle bridge balance mismatch 🚨🚨🚨");
    assert_eq!(
        findings[0].description,
        "Total supply of bridged wstETH is greater than balanceOf L1 bridge side!\nL2 total supply: 60000.00\nL1 balanceOf: 50000.00\n\nETH: 20000000\nMantle: 1011\n"
    );
    assert_eq!(findings[0].severity, Severity::Critical);
    assert!(findings[0].unique_key.is_some());

    // nothing new on L2, nothing to check
    assert!(s.agent.handle_block(&l1_block()).await.is_empty());
}

#[tokio::test]
async fn test_l2_head_failure_is_one_finding() {
    let mut s = setup();
    assert!(s.agent.initialize(&l1_block()).await.is_empty());
    s.l2.fail("get_latest_block");

    let findings = s.agent.handle_block(&l1_block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].alert_id, "NETWORK-ERROR");
    assert_eq!(findings[0].description, "Could not call provider.get_latest_block");
    assert!(findings[0].name.starts_with("Error in BridgeAgent.next_blocks:"));
}

#[tokio::test]
async fn test_initialize_failure_is_reported() {
    let mut s = setup();
    s.l2.fail("get_latest_block");

    let errors = s.agent.initialize(&l1_block()).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].description, "Could not call l2.get_latest_block");
    assert!(errors[0].name.starts_with("Error in BridgeAgent.initialize:"));
}

#[tokio::test]
async fn test_l1_balance_failure_is_one_finding() {
    let mut s = setup();
    assert!(s.agent.initialize(&l1_block()).await.is_empty());
    s.l2.push_blocks(1_011, 1_013, l2_time(1_011));
    s.l1.fail("balanceOf(address)");

    let findings = s.agent.handle_block(&l1_block()).await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].description, "Could not call l1.balanceOf(address)");
}

#[tokio::test]
async fn test_l2_supply_failure_per_block() {
    let mut s = setup();
    assert!(s.agent.initialize(&l1_block()).await.is_empty());
    s.l2.push_blocks(1_011, 1_012, l2_time(1_011));
    s.l2.fail("totalSupply()");

    let findings = s.agent.handle_block(&l1_block()).await;
    assert_eq!(findings.len(), 2);
    assert!(findings.iter().all(|f| f.description == "Could not call l2.totalSupply()"));
    assert_eq!(findings[1].metadata.get("block").map(String::as_str), Some("1012"));
}

#[tokio::test]
async fn test_l1_admin_events() {
    let s = setup();
    let mut agent = s.agent;
    let bridge = s.config.l1_bridge;
    let logs = vec![
        encode_event(
            bridge,
            &DepositsDisabled {
                disabler: Address::repeat_byte(3),
            },
            L1_BLOCK,
            0,
        ),
        encode_event(
            bridge,
            &RoleGranted {
                role: BRIDGE_ROLES[0].0,
                account: Address::repeat_byte(4),
                sender: Address::repeat_byte(5),
            },
            L1_BLOCK,
            1,
        ),
    ];
    let tx = TransactionEvent {
        hash: B256::repeat_byte(1),
        to: Some(bridge),
        block: l1_block(),
        logs,
    };

    let findings = agent.handle_transaction(&tx).await;
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].alert_id, "L1-BRIDGE-DEPOSITS-DISABLED");
    assert_eq!(findings[0].severity, Severity::High);
    assert_eq!(findings[1].alert_id, "L1-BRIDGE-ROLE-GRANTED");
    assert!(findings[1]
        .description
        .starts_with("Role DEPOSITS ENABLER ROLE was granted to"));
}
