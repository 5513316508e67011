//! CLI application for the stETH monitoring agents.

use alloy::primitives::Address;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steth_monitor_agents::{
    Agent, AgentsConfig, BridgeAgent, GateSealAgent, HealthChecker, StethOperationAgent, WithdrawalsAgent,
};
use steth_monitor_db::{DbPool, SqliteWithdrawalsRepo};
use steth_monitor_heuristics::{Finding, Severity};
use steth_monitor_ingestion::{group_transactions, BlockReconciler, EtherscanConfig, RpcClient};
use steth_monitor_provider::{BlockRef, ChainProvider, TransactionEvent};
use steth_monitor_telemetry::audit::append_jsonl;
use steth_monitor_telemetry::{init_logging, LogFormat, Metrics};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const LOOP_COMPONENT: &str = "BlockLoop";

#[derive(Parser)]
#[command(name = "steth-monitor")]
#[command(about = "Monitoring agents for stETH, the withdrawals queue, GateSeal and the L2 bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agents against the chain head
    Run(RunArgs),
    /// Validate an agents config file and print the effective configuration
    CheckConfig {
        /// Agents config (JSON); defaults are checked when omitted
        #[arg(long, env = "AGENTS_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Ethereum execution RPC URL
    #[arg(long, env = "ETHEREUM_RPC_URL")]
    execution_rpc_url: String,

    /// L2 execution RPC URL; enables the bridge agent
    #[arg(long, env = "L2_RPC_URL")]
    l2_rpc_url: Option<String>,

    /// Etherscan-compatible API used for depositor history
    #[arg(long, env = "ETHERSCAN_API_URL", default_value = "https://api.etherscan.io/api")]
    etherscan_api_url: String,

    /// Etherscan API key; depositor history is unavailable without it
    #[arg(long, env = "ETHERSCAN_API_KEY")]
    etherscan_api_key: Option<String>,

    /// Database path, or :memory:
    #[arg(long, env = "DATABASE_PATH", default_value = ":memory:")]
    database_path: String,

    /// Agents config (JSON); mainnet defaults when omitted
    #[arg(long, env = "AGENTS_CONFIG")]
    config: Option<PathBuf>,

    /// Poll interval in seconds
    #[arg(long, default_value = "12")]
    poll_interval_seconds: u64,

    /// Metrics and health bind address
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:9090")]
    metrics_bind_address: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: String,

    /// Append emitted findings to this JSON lines file
    #[arg(long, env = "FINDINGS_OUTPUT_PATH")]
    findings_output_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_logging(args.log_level.as_deref(), args.log_format.parse()?)?;
            run_agents(args).await?;
        }
        Commands::CheckConfig { config } => {
            init_logging(None, LogFormat::Text)?;
            let config = AgentsConfig::load(config.as_deref()).context("Invalid agents config")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Where findings go once the agents emit them.
struct FindingsSink {
    metrics: Metrics,
    health: Arc<Mutex<HealthChecker>>,
    output_path: Option<PathBuf>,
}

impl FindingsSink {
    /// Log, count and persist findings, and feed the health checker.
    ///
    /// # Arguments
    /// * `findings` - Findings of one block, in agent order
    /// * `now` - Unix seconds the findings belong to
    fn publish(&self, findings: &[Finding], now: u64) {
        for finding in findings {
            match finding.severity {
                Severity::High | Severity::Critical => warn!(
                    "{} [{}] {}: {}",
                    finding.alert_id,
                    finding.severity.as_str(),
                    finding.name,
                    finding.description
                ),
                _ => info!(
                    "{} [{}] {}: {}",
                    finding.alert_id,
                    finding.severity.as_str(),
                    finding.name,
                    finding.description
                ),
            }
            self.metrics.inc_findings(finding.severity.as_str());
            if finding.is_degraded() {
                self.metrics.inc_source_errors();
            }
        }

        if let Err(e) = append_jsonl(self.output_path.as_ref(), findings) {
            error!("Failed to write findings: {}", e);
        }

        match self.health.lock() {
            Ok(mut health) => {
                let errors = health.observe(findings, now);
                if !health.is_healthy() {
                    warn!("{} network errors within the health window", errors);
                }
            }
            Err(e) => error!("Health checker unavailable: {}", e),
        }
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

async fn run_agents(args: RunArgs) -> anyhow::Result<()> {
    info!("Starting stETH monitoring agents");

    let config = AgentsConfig::load(args.config.as_deref()).context("Invalid agents config")?;
    let metrics = Metrics::new()?;

    let mut l1_client = RpcClient::new(&args.execution_rpc_url, metrics.clone())?;
    match args.etherscan_api_key {
        Some(api_key) => {
            l1_client = l1_client.with_etherscan(EtherscanConfig {
                api_url: args.etherscan_api_url,
                api_key,
            });
        }
        None => warn!("No Etherscan API key, depositor history will be unavailable"),
    }
    let l1: Arc<dyn ChainProvider> = Arc::new(l1_client);

    let db = DbPool::new(&args.database_path).await?;
    db.migrate().await?;
    let repo = Arc::new(SqliteWithdrawalsRepo::new(db));

    let mut agents: Vec<Box<dyn Agent>> = vec![
        Box::new(StethOperationAgent::new(l1.clone(), config.steth.clone())),
        Box::new(WithdrawalsAgent::new(l1.clone(), repo, config.withdrawals.clone())),
        Box::new(GateSealAgent::new(l1.clone(), config.gate_seal.clone())),
    ];
    match &args.l2_rpc_url {
        Some(url) => {
            let l2: Arc<dyn ChainProvider> = Arc::new(RpcClient::new(url, metrics.clone())?);
            agents.push(Box::new(BridgeAgent::new(l1.clone(), l2, config.bridge.clone())));
        }
        None => info!("No L2 RPC URL, {} bridge agent disabled", config.bridge.network_name),
    }

    let health = Arc::new(Mutex::new(HealthChecker::default()));
    let sink = FindingsSink {
        metrics: metrics.clone(),
        health: health.clone(),
        output_path: args.findings_output_path,
    };

    start_metrics_server(&args.metrics_bind_address, metrics, health).await?;

    let start = l1
        .get_latest_block()
        .await
        .context("Failed to fetch the start block")?;
    info!("Initializing {} agents at block {}", agents.len(), start.number);
    let mut init_findings = Vec::new();
    for agent in agents.iter_mut() {
        let started = Instant::now();
        let errors = agent.initialize(&start).await;
        if errors.is_empty() {
            info!("{} initialized in {:?}", agent.name(), started.elapsed());
        } else {
            warn!("{} initialized with {} errors in {:?}", agent.name(), errors.len(), started.elapsed());
        }
        init_findings.extend(errors);
    }
    sink.publish(&init_findings, start.timestamp);

    let watched: Vec<Address> = agents
        .iter()
        .flat_map(|agent| agent.watched_addresses())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut reconciler = BlockReconciler::resume_from(l1, LOOP_COMPONENT, start);
    let poll_duration = Duration::from_secs(args.poll_interval_seconds);

    loop {
        run_tick(&mut reconciler, &mut agents, &watched, &sink).await;

        tokio::select! {
            _ = sleep(poll_duration) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

/// Process every block that appeared since the last tick.
async fn run_tick(
    reconciler: &mut BlockReconciler,
    agents: &mut [Box<dyn Agent>],
    watched: &[Address],
    sink: &FindingsSink,
) {
    let started = Instant::now();
    let blocks = match reconciler.next_blocks().await {
        Ok(blocks) => blocks,
        Err(e) => {
            warn!("{}", e);
            sink.publish(&[e.to_finding()], now_secs());
            return;
        }
    };
    let Some(last) = blocks.last() else {
        debug!("No new blocks");
        return;
    };

    let logs = match reconciler.logs_for(&blocks, watched).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!("{}", e);
            sink.publish(&[e.to_finding()], last.timestamp);
            Vec::new()
        }
    };
    let transactions = group_transactions(logs, &blocks);

    for block in &blocks {
        let block_txs: Vec<&TransactionEvent> = transactions
            .iter()
            .filter(|tx| tx.block.number == block.number)
            .collect();
        let findings = handle_block(agents, block, &block_txs).await;

        sink.metrics.inc_blocks_processed();
        sink.metrics.inc_transactions_processed(block_txs.len() as u64);
        sink.publish(&findings, block.timestamp);
    }

    debug!(
        "Processed blocks {}..={} in {:?}",
        blocks[0].number,
        last.number,
        started.elapsed()
    );
}

/// Run all agents on one block concurrently: transactions first, then the
/// block itself.
async fn handle_block(agents: &mut [Box<dyn Agent>], block: &BlockRef, txs: &[&TransactionEvent]) -> Vec<Finding> {
    let per_agent = join_all(agents.iter_mut().map(|agent| async move {
        let started = Instant::now();
        let mut findings = Vec::new();
        for tx in txs {
            findings.extend(agent.handle_transaction(tx).await);
        }
        findings.extend(agent.handle_block(block).await);
        debug!("{} handled block {} in {:?}", agent.name(), block.number, started.elapsed());
        findings
    }))
    .await;
    per_agent.into_iter().flatten().collect()
}

struct ServerState {
    metrics: Metrics,
    health: Arc<Mutex<HealthChecker>>,
}

async fn start_metrics_server(
    addr: &str,
    metrics: Metrics,
    health: Arc<Mutex<HealthChecker>>,
) -> anyhow::Result<()> {
    use axum::{extract::State, http::Method, http::StatusCode, response::IntoResponse, routing::get, Router};
    use tower_http::cors::{Any, CorsLayer};

    let state = Arc::new(ServerState { metrics, health });

    async fn metrics_handler(State(state): State<Arc<ServerState>>) -> Result<impl IntoResponse, StatusCode> {
        match state.metrics.gather() {
            Ok(body) => Ok((StatusCode::OK, body)),
            Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
        let status = state
            .health
            .lock()
            .map(|health| (health.is_healthy(), health.error_count()));
        match status {
            Ok((true, _)) => (StatusCode::OK, "ok".to_string()),
            Ok((false, errors)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{} network errors within the health window", errors),
            ),
            Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "health checker unavailable".to_string()),
        }
    }

    let cors = CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]);
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics server listening on http://{}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}
