//! Persistence layer for the stETH monitoring agents.
//!
//! Provides SQLite storage for withdrawal requests with schema migrations,
//! plus an in-memory repository with the same interface.

pub mod memory;
pub mod models;
pub mod pool;
pub mod repo;

pub use memory::MemoryWithdrawalsRepo;
pub use models::WithdrawalRequest;
pub use pool::DbPool;
pub use repo::{RepoError, RepoResult, SqliteWithdrawalsRepo, WithdrawalsRepository};
