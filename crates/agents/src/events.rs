//! Contract events the agents watch, and the table-driven rules that turn
//! single events into findings.

use alloy::primitives::{b256, Address, B256};
use alloy::sol;
use steth_monitor_heuristics::{Finding, FindingType, Severity};
use steth_monitor_provider::{ChainLog, TransactionEvent};

sol! {
    #[derive(Debug)]
    event StakingPaused();
    #[derive(Debug)]
    event StakingResumed();
    #[derive(Debug)]
    event StakingLimitSet(uint256 maxStakeLimit, uint256 stakeLimitIncreasePerBlock);
    #[derive(Debug)]
    event StakingLimitRemoved();
    #[derive(Debug)]
    event Unbuffered(uint256 amount);
    #[derive(Debug)]
    event TokenRebased(
        uint256 indexed reportTimestamp,
        uint256 timeElapsed,
        uint256 preTotalShares,
        uint256 preTotalEther,
        uint256 postTotalShares,
        uint256 postTotalEther,
        uint256 sharesMintedAsFees
    );
    #[derive(Debug)]
    event OwnershipTransferred(address indexed previousOwner, address indexed newOwner);

    #[derive(Debug)]
    event WithdrawalRequested(
        uint256 indexed requestId,
        address indexed requestor,
        address indexed owner,
        uint256 amountOfStETH,
        uint256 amountOfShares
    );
    #[derive(Debug)]
    event WithdrawalsFinalized(
        uint256 indexed from,
        uint256 indexed to,
        uint256 amountOfETHLocked,
        uint256 sharesToBurn,
        uint256 timestamp
    );
    #[derive(Debug)]
    event WithdrawalClaimed(
        uint256 indexed requestId,
        address indexed owner,
        address indexed receiver,
        uint256 amountOfETH
    );

    #[derive(Debug)]
    event GateSealCreated(address gate_seal);
    #[derive(Debug)]
    event Sealed(address gate_seal, address sealed_by, uint256 sealed_for, address sealable, uint256 sealed_until);

    #[derive(Debug)]
    event BridgingInitiated(address indexed sender, address recipient, address indexed token, uint256 indexed amount);
    #[derive(Debug)]
    event WithdrawalInitiated(
        address indexed _l1Token,
        address indexed _l2Token,
        address indexed _from,
        address _to,
        uint256 _amount,
        bytes _data
    );
    #[derive(Debug)]
    event DepositsEnabled(address indexed enabler);
    #[derive(Debug)]
    event DepositsDisabled(address indexed disabler);
    #[derive(Debug)]
    event WithdrawalsEnabled(address indexed enabler);
    #[derive(Debug)]
    event WithdrawalsDisabled(address indexed disabler);
    #[derive(Debug)]
    event RoleGranted(bytes32 indexed role, address indexed account, address indexed sender);
    #[derive(Debug)]
    event RoleRevoked(bytes32 indexed role, address indexed account, address indexed sender);
}

/// Bridge access-control roles with readable names.
pub const BRIDGE_ROLES: [(B256, &str); 5] = [
    (
        b256!("4b43b36766bde12c5e9cbbc37d15f8d1f769f08f54720ab370faeb4ce893753a"),
        "DEPOSITS ENABLER ROLE",
    ),
    (
        b256!("63f736f21cb2943826cd50b191eb054ebbea670e4e962d0527611f830cd399d6"),
        "DEPOSITS DISABLER ROLE",
    ),
    (
        b256!("9ab8816a3dc0b3849ec1ac00483f6ec815b07eee2fd766a353311c823ad59d0d"),
        "WITHDRAWALS ENABLER ROLE",
    ),
    (
        b256!("94a954c0bc99227eddbc0715a62a7e1056ed8784cd719c2303b685683908857c"),
        "WITHDRAWALS DISABLER ROLE",
    ),
    (B256::ZERO, "DEFAULT ADMIN ROLE"),
];

/// Readable name of a bridge role, or its hash when unknown.
pub fn role_name(role: B256) -> String {
    BRIDGE_ROLES
        .iter()
        .find(|(hash, _)| *hash == role)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| role.to_string())
}

/// One event-to-finding mapping.
///
/// `describe` decodes the log and renders the description; returning `None`
/// skips the log.
#[derive(Debug, Clone)]
pub struct EventRule {
    pub address: Address,
    pub topic: B256,
    pub alert_id: &'static str,
    pub name: &'static str,
    pub severity: Severity,
    pub finding_type: FindingType,
    pub describe: fn(&ChainLog) -> Option<String>,
}

impl EventRule {
    fn matches(&self, log: &ChainLog) -> bool {
        log.address == self.address && log.topics.first() == Some(&self.topic)
    }
}

/// Apply every rule to every log of a transaction.
///
/// # Returns
/// Findings in log order; a log matching several rules yields one finding
/// per rule.
pub fn apply_rules(rules: &[EventRule], tx: &TransactionEvent) -> Vec<Finding> {
    let mut logs: Vec<&ChainLog> = tx.logs.iter().collect();
    logs.sort_by_key(|log| log.log_index);

    let mut findings = Vec::new();
    for log in logs {
        for rule in rules.iter().filter(|rule| rule.matches(log)) {
            if let Some(description) = (rule.describe)(log) {
                findings.push(
                    Finding::new(rule.alert_id, rule.name, description, rule.severity, rule.finding_type)
                        .with_metadata("tx", tx.hash)
                        .with_metadata("block", log.block_number),
                );
            }
        }
    }
    findings
}
