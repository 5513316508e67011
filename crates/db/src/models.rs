//! Database models and types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// A withdrawal request made to the withdrawal queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: u64,
    /// Requested amount in wei of stETH.
    pub amount_of_steth: Decimal,
    pub amount_of_shares: Decimal,
    /// Checksummed owner address.
    pub owner: String,
    /// Unix seconds of the request.
    pub timestamp: u64,
    pub is_finalized: bool,
    pub is_claimed: bool,
}

/// Row of the `withdrawal_requests` table.
#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalRequestRow {
    pub id: i64,
    pub amount_steth: String, // Stored as string to preserve precision
    pub amount_shares: String,
    pub owner: String,
    pub timestamp: i64,
    pub finalized: bool,
    pub claimed: bool,
}

impl TryFrom<WithdrawalRequestRow> for WithdrawalRequest {
    type Error = rust_decimal::Error;

    fn try_from(row: WithdrawalRequestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id as u64,
            amount_of_steth: Decimal::from_str(&row.amount_steth)?,
            amount_of_shares: Decimal::from_str(&row.amount_shares)?,
            owner: row.owner,
            timestamp: row.timestamp as u64,
            is_finalized: row.finalized,
            is_claimed: row.claimed,
        })
    }
}
