//! Withdrawal request persistence.

use crate::models::{WithdrawalRequest, WithdrawalRequestRow};
use crate::DbPool;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

/// Error type for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Withdrawal request not found: {0}")]
    NotFound(u64),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: u64, reason: String },
}

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Storage for withdrawal requests seen on chain.
#[async_trait]
pub trait WithdrawalsRepository: Send + Sync {
    /// Get a request by id.
    ///
    /// # Returns
    /// The request, or `RepoError::NotFound` if it was never stored or was removed.
    async fn get_by_id(&self, id: u64) -> RepoResult<WithdrawalRequest>;

    /// Ids of every request that is not claimed yet, ascending.
    async fn get_unclaimed_ids(&self) -> RepoResult<Vec<u64>>;

    /// Insert new requests and overwrite existing ones, atomically.
    async fn create_or_update(&self, requests: &[WithdrawalRequest]) -> RepoResult<()>;

    /// Delete requests by id. Unknown ids are ignored.
    ///
    /// # Returns
    /// Number of requests deleted.
    async fn remove_by_ids(&self, ids: &[u64]) -> RepoResult<u64>;
}

const SELECT_COLUMNS: &str =
    "SELECT id, amount_steth, amount_shares, owner, timestamp, finalized, claimed FROM withdrawal_requests";

/// SQLite-backed repository.
#[derive(Clone)]
pub struct SqliteWithdrawalsRepo {
    db: DbPool,
}

impl SqliteWithdrawalsRepo {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn into_model(row: WithdrawalRequestRow) -> RepoResult<WithdrawalRequest> {
    let id = row.id as u64;
    WithdrawalRequest::try_from(row).map_err(|e| RepoError::Corrupt {
        id,
        reason: e.to_string(),
    })
}

#[async_trait]
impl WithdrawalsRepository for SqliteWithdrawalsRepo {
    async fn get_by_id(&self, id: u64) -> RepoResult<WithdrawalRequest> {
        let row: Option<WithdrawalRequestRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id as i64)
            .fetch_optional(self.db.pool())
            .await?;

        match row {
            Some(row) => into_model(row),
            None => Err(RepoError::NotFound(id)),
        }
    }

    async fn get_unclaimed_ids(&self) -> RepoResult<Vec<u64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM withdrawal_requests WHERE claimed = 0 ORDER BY id")
            .fetch_all(self.db.pool())
            .await?;

        Ok(ids.into_iter().map(|id| id as u64).collect())
    }

    async fn create_or_update(&self, requests: &[WithdrawalRequest]) -> RepoResult<()> {
        let mut tx = self.db.pool().begin().await?;

        for request in requests {
            sqlx::query(
                r#"
                INSERT INTO withdrawal_requests (
                    id, amount_steth, amount_shares, owner, timestamp, finalized, claimed
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    amount_steth = excluded.amount_steth,
                    amount_shares = excluded.amount_shares,
                    owner = excluded.owner,
                    timestamp = excluded.timestamp,
                    finalized = excluded.finalized,
                    claimed = excluded.claimed
                "#,
            )
            .bind(request.id as i64)
            .bind(request.amount_of_steth.to_string())
            .bind(request.amount_of_shares.to_string())
            .bind(&request.owner)
            .bind(request.timestamp as i64)
            .bind(request.is_finalized)
            .bind(request.is_claimed)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Stored {} withdrawal requests", requests.len());
        Ok(())
    }

    async fn remove_by_ids(&self, ids: &[u64]) -> RepoResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM withdrawal_requests WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id as i64);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(self.db.pool()).await?;
        debug!("Removed {} withdrawal requests", result.rows_affected());
        Ok(result.rows_affected())
    }
}
