//! Chain ingestion for the stETH monitoring agents.
//!
//! [`RpcClient`] talks JSON-RPC to an execution node; [`BlockReconciler`]
//! turns head polls into an ordered stream of blocks and transactions.

pub mod reconciler;
pub mod rpc_client;

pub use reconciler::{group_transactions, BlockReconciler, ReconcilerState};
pub use rpc_client::{EtherscanConfig, RpcClient};
