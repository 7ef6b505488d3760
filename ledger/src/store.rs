use midway_types::{Balance, Transaction, HISTORY_CAP};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Current unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct Inner {
    coins: u64,
    tickets: u64,
    /// Most recent first, capped at [`HISTORY_CAP`].
    transactions: Vec<Transaction>,
    loading: bool,
    last_synced_at: Option<u64>,
    /// Stamp of the last applied snapshot. Incoming writes carry a stamp
    /// drawn from `next_stamp` and are dropped when older than this, so an
    /// in-flight refresh cannot clobber a newer push update.
    stamp: u64,
    next_stamp: u64,
}

/// In-memory source of truth for one account's balances and history.
///
/// Consumers only read; the synchronizer and mutation gateway are the only
/// writers, and every balance write goes through the stamped application
/// methods (last write wins at snapshot granularity, never per field).
#[derive(Clone, Default)]
pub struct BalanceStore {
    inner: Arc<RwLock<Inner>>,
}

impl BalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest locally-known balances. Never blocks on the network.
    pub fn balance(&self) -> Balance {
        let inner = self.read();
        Balance {
            coins: inner.coins,
            tickets: inner.tickets,
        }
    }

    /// Whether `coins >= amount`. Callers use this as a fast guard; the
    /// mutation gateway re-validates independently.
    pub fn can_afford(&self, amount: u64) -> bool {
        self.read().coins >= amount
    }

    /// Up to `limit` transactions, most recent first.
    pub fn history(&self, limit: usize) -> Vec<Transaction> {
        let inner = self.read();
        inner.transactions.iter().take(limit).cloned().collect()
    }

    pub fn loading(&self) -> bool {
        self.read().loading
    }

    pub fn last_synced_at(&self) -> Option<u64> {
        self.read().last_synced_at
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.write().loading = loading;
    }

    /// Draws the stamp for the next snapshot write. Writers must draw their
    /// stamp *before* any suspension point so that a concurrent writer that
    /// observed fresher data also carries a larger stamp.
    pub(crate) fn next_stamp(&self) -> u64 {
        let mut inner = self.write();
        inner.next_stamp += 1;
        inner.next_stamp
    }

    /// Applies a full snapshot (balance and history). Returns false when the
    /// stamp is stale and the snapshot was dropped.
    pub(crate) fn apply_snapshot(
        &self,
        stamp: u64,
        balance: Balance,
        mut transactions: Vec<Transaction>,
        synced_at: Option<u64>,
    ) -> bool {
        transactions.truncate(HISTORY_CAP);
        let mut inner = self.write();
        if stamp < inner.stamp {
            debug!(stamp, current = inner.stamp, "dropping stale snapshot");
            return false;
        }
        inner.stamp = stamp;
        inner.coins = balance.coins;
        inner.tickets = balance.tickets;
        inner.transactions = transactions;
        if synced_at.is_some() {
            inner.last_synced_at = synced_at;
        }
        true
    }

    /// Applies balance fields only (push updates, optimistic writes).
    pub(crate) fn apply_balance(&self, stamp: u64, balance: Balance) -> bool {
        let mut inner = self.write();
        if stamp < inner.stamp {
            debug!(stamp, current = inner.stamp, "dropping stale balance");
            return false;
        }
        inner.stamp = stamp;
        inner.coins = balance.coins;
        inner.tickets = balance.tickets;
        true
    }

    /// Replaces the history list only (transaction-insert push events trigger
    /// a full re-fetch rather than an incremental append).
    pub(crate) fn apply_transactions(
        &self,
        stamp: u64,
        mut transactions: Vec<Transaction>,
    ) -> bool {
        transactions.truncate(HISTORY_CAP);
        let mut inner = self.write();
        if stamp < inner.stamp {
            debug!(stamp, current = inner.stamp, "dropping stale history");
            return false;
        }
        inner.stamp = stamp;
        inner.transactions = transactions;
        true
    }

    /// Prepends a freshly committed transaction to the history. A push
    /// update can re-fetch the list while the commit is still in flight, so
    /// a row that already arrived that way is not inserted again.
    pub(crate) fn record_transaction(&self, transaction: Transaction) {
        let mut inner = self.write();
        if inner.transactions.iter().any(|t| t.id == transaction.id) {
            return;
        }
        inner.transactions.insert(0, transaction);
        inner.transactions.truncate(HISTORY_CAP);
    }

    pub(crate) fn mark_synced(&self, at: u64) {
        self.write().last_synced_at = Some(at);
    }
}
