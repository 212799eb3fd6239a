//! Per-account async locks.
//!
//! Every ledger mutation takes the locks of the accounts it touches, in
//! sorted order so two entries sharing accounts can never deadlock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::{LedgerError, LedgerResult};
use crate::metrics::record_lock_timeout;
use crate::models::AccountId;

/// Idle locks are pruned once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Held account locks. Released on drop.
pub struct AccountGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// Table of per-account mutexes.
pub struct AccountLocks {
    locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl AccountLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the locks of `accounts`.
    ///
    /// Fails with [`LedgerError::Retryable`] if all locks cannot be taken
    /// within the configured timeout.
    pub async fn acquire(&self, accounts: &[AccountId]) -> LedgerResult<AccountGuard> {
        let mut ids: Vec<&AccountId> = accounts.iter().collect();
        ids.sort();
        ids.dedup();

        let mutexes: Vec<Arc<Mutex<()>>> = {
            let mut table = self.locks.lock().await;
            if table.len() > PRUNE_THRESHOLD {
                table.retain(|_, m| Arc::strong_count(m) > 1);
            }
            ids.iter()
                .map(|id| table.entry((*id).clone()).or_default().clone())
                .collect()
        };

        let acquire_all = async {
            let mut guards = Vec::with_capacity(mutexes.len());
            for mutex in mutexes {
                guards.push(mutex.lock_owned().await);
            }
            guards
        };

        match tokio::time::timeout(self.timeout, acquire_all).await {
            Ok(guards) => Ok(AccountGuard { _guards: guards }),
            Err(_) => {
                record_lock_timeout();
                warn!(accounts = ids.len(), timeout_ms = self.timeout.as_millis(), "⏳ Account lock timeout");
                Err(LedgerError::Retryable(format!(
                    "could not lock {} account(s) within {:?}",
                    ids.len(),
                    self.timeout
                )))
            }
        }
    }
}
