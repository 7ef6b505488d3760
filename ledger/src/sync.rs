use crate::{
    events::Stream,
    local::LocalStore,
    remote::RemoteStore,
    store::{now_millis, BalanceStore},
    Error, Result,
};
use midway_types::{Balance, Transaction, Update, HISTORY_CAP};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// An authenticated user. Present only while signed in; without one the
/// ledger runs against the local fallback store and rejects mutations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub account_id: String,
}

impl Session {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }
}

/// Synchronization lifecycle. Doubles as the re-entrancy guard: a second
/// `initialize` call observes anything but `Uninitialized` and returns
/// without re-subscribing or double-fetching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Initializing,
    /// Initial fetch succeeded and the push subscription is live.
    RemoteSynced,
    /// No session, or remote was unreachable at startup. No push updates;
    /// balances only change through local reads.
    LocalOnly,
}

/// The ledger service: holds the balance store, mediates every coin/ticket
/// mutation, and reconciles with server-pushed updates.
///
/// Constructed by the application's composition root and shared with
/// consumers by reference; consumers read balances and call mutation
/// operations, never the backing stores directly.
pub struct Ledger {
    pub(crate) store: BalanceStore,
    pub(crate) remote: Arc<RemoteStore>,
    pub(crate) local: Arc<LocalStore>,
    pub(crate) session: Option<Session>,
    state: Mutex<SyncState>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Ledger {
    pub fn new(remote: RemoteStore, local: LocalStore, session: Option<Session>) -> Self {
        Self {
            store: BalanceStore::new(),
            remote: Arc::new(remote),
            local: Arc::new(local),
            session,
            state: Mutex::new(SyncState::Uninitialized),
            drain: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn balance(&self) -> Balance {
        self.store.balance()
    }

    pub fn coins(&self) -> u64 {
        self.store.balance().coins
    }

    pub fn tickets(&self) -> u64 {
        self.store.balance().tickets
    }

    pub fn can_afford(&self, amount: u64) -> bool {
        self.store.can_afford(amount)
    }

    /// Up to `limit` transactions, most recent first.
    pub fn history(&self, limit: usize) -> Vec<Transaction> {
        self.store.history(limit)
    }

    pub fn loading(&self) -> bool {
        self.store.loading()
    }

    pub fn last_synced_at(&self) -> Option<u64> {
        self.store.last_synced_at()
    }

    /// One-time startup synchronization.
    ///
    /// With a session: fetch balance and recent transactions in parallel,
    /// seed the record on first use, and establish the push subscription.
    /// Without one, or when any of that fails: load the local fallback store
    /// and continue without push updates. Calling this again while started
    /// is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SyncState::Uninitialized {
                debug!(state = ?*state, "initialize skipped; already started");
                return Ok(());
            }
            *state = SyncState::Initializing;
        }
        self.store.set_loading(true);

        let next = match &self.session {
            Some(session) => {
                let account_id = session.account_id.clone();
                match self.initialize_remote(&account_id).await {
                    Ok(()) => Ok(SyncState::RemoteSynced),
                    Err(err) => {
                        warn!(%err, "remote initialization failed; falling back to local store");
                        self.load_local().await.map(|()| SyncState::LocalOnly)
                    }
                }
            }
            None => self.load_local().await.map(|()| SyncState::LocalOnly),
        };

        self.store.set_loading(false);
        match next {
            Ok(state) => {
                info!(?state, "ledger initialized");
                self.set_state(state);
                Ok(())
            }
            Err(err) => {
                // Leave the guard open so the composition root may retry.
                self.set_state(SyncState::Uninitialized);
                Err(err)
            }
        }
    }

    async fn initialize_remote(&self, account_id: &str) -> Result<()> {
        let stamp = self.store.next_stamp();
        let (record, transactions) = tokio::try_join!(
            self.remote.fetch_balance(account_id),
            self.remote.recent_transactions(account_id, HISTORY_CAP),
        )?;

        let balance = match record {
            Some(record) => record.balance(),
            None => {
                let seeded = Balance::starting();
                self.remote
                    .upsert_balance(account_id, seeded.coins, seeded.tickets)
                    .await?;
                info!(account_id, coins = seeded.coins, "seeded balance record on first use");
                seeded
            }
        };

        let updates = self.remote.subscribe_updates(account_id).await?;
        self.store
            .apply_snapshot(stamp, balance, transactions.clone(), Some(now_millis()));
        self.mirror_local(balance, &transactions).await;
        self.spawn_drain(account_id.to_string(), updates);
        Ok(())
    }

    async fn load_local(&self) -> Result<()> {
        let stamp = self.store.next_stamp();
        let balance = self
            .local
            .load_balance()
            .await?
            .unwrap_or_else(Balance::starting);
        let transactions = self.local.load_transactions().await?;
        self.store.apply_snapshot(stamp, balance, transactions, None);
        Ok(())
    }

    /// Re-fetch ground truth from the remote store and overwrite local state.
    ///
    /// Doubles as the rollback mechanism: the mutation gateway calls this
    /// after any remote failure to discard its optimistic update. The stamp
    /// is drawn before the fetch, so a push update that lands mid-flight
    /// wins over the refresh result.
    pub async fn refresh(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::NoSession)?;
        let account_id = session.account_id.as_str();

        let stamp = self.store.next_stamp();
        let (record, transactions) = tokio::try_join!(
            self.remote.fetch_balance(account_id),
            self.remote.recent_transactions(account_id, HISTORY_CAP),
        )?;
        let balance = record
            .map(|r| r.balance())
            .unwrap_or_else(Balance::starting);
        if self
            .store
            .apply_snapshot(stamp, balance, transactions.clone(), Some(now_millis()))
        {
            self.mirror_local(balance, &transactions).await;
        }
        Ok(())
    }

    /// Tear down the push subscription. Safe to call more than once; after
    /// shutdown the service may be initialized again.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("updates subscription torn down");
        }
        self.set_state(SyncState::Uninitialized);
    }

    /// Mirror a synced snapshot into the fallback keys so an offline start
    /// sees the last known state. Failures here never fail the sync.
    async fn mirror_local(&self, balance: Balance, transactions: &[Transaction]) {
        if let Err(err) = self.local.store_balance(balance).await {
            warn!(%err, "failed to mirror balance to local store");
            return;
        }
        if let Err(err) = self.local.store_transactions(transactions).await {
            warn!(%err, "failed to mirror transactions to local store");
        }
    }

    fn spawn_drain(&self, account_id: String, mut updates: Stream<Update>) {
        let store = self.store.clone();
        let remote = self.remote.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = updates.next().await {
                match event {
                    Ok(Update::Balance(record)) => {
                        if record.account_id != account_id {
                            continue;
                        }
                        let stamp = store.next_stamp();
                        store.apply_balance(stamp, record.balance());
                        store.mark_synced(now_millis());
                    }
                    Ok(Update::Transaction(_)) => {
                        // The payload is only a signal; re-fetch so ordering
                        // and denormalized fields come from the server.
                        let stamp = store.next_stamp();
                        match remote.recent_transactions(&account_id, HISTORY_CAP).await {
                            Ok(transactions) => {
                                store.apply_transactions(stamp, transactions);
                            }
                            Err(err) => {
                                warn!(%err, "re-fetch after transaction push failed");
                            }
                        }
                    }
                    Err(Error::ConnectionClosed) => {
                        info!("updates stream closed");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "updates stream error");
                    }
                }
            }
        });
        *self.drain.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if let Some(handle) = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
