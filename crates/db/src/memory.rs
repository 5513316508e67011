//! In-memory repository for tests and dry runs.

use crate::models::WithdrawalRequest;
use crate::repo::{RepoError, RepoResult, WithdrawalsRepository};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// [`WithdrawalsRepository`] over a `BTreeMap`, with injectable failures.
#[derive(Default)]
pub struct MemoryWithdrawalsRepo {
    requests: Mutex<BTreeMap<u64, WithdrawalRequest>>,
    failures: Mutex<HashSet<&'static str>>,
}

impl MemoryWithdrawalsRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation (e.g. `"get_by_id"`) fail until [`Self::recover`].
    pub fn fail(&self, operation: &'static str) {
        lock(&self.failures).insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        lock(&self.failures).remove(operation);
    }

    pub fn len(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, operation: &'static str) -> RepoResult<()> {
        if lock(&self.failures).contains(operation) {
            return Err(RepoError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl WithdrawalsRepository for MemoryWithdrawalsRepo {
    async fn get_by_id(&self, id: u64) -> RepoResult<WithdrawalRequest> {
        self.check("get_by_id")?;
        lock(&self.requests).get(&id).cloned().ok_or(RepoError::NotFound(id))
    }

    async fn get_unclaimed_ids(&self) -> RepoResult<Vec<u64>> {
        self.check("get_unclaimed_ids")?;
        Ok(lock(&self.requests)
            .values()
            .filter(|r| !r.is_claimed)
            .map(|r| r.id)
            .collect())
    }

    async fn create_or_update(&self, requests: &[WithdrawalRequest]) -> RepoResult<()> {
        self.check("create_or_update")?;
        let mut stored = lock(&self.requests);
        for request in requests {
            stored.insert(request.id, request.clone());
        }
        Ok(())
    }

    async fn remove_by_ids(&self, ids: &[u64]) -> RepoResult<u64> {
        self.check("remove_by_ids")?;
        let mut stored = lock(&self.requests);
        Ok(ids.iter().filter(|id| stored.remove(*id).is_some()).count() as u64)
    }
}
