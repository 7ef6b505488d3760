use crate::{store::now_millis, sync::Ledger, Error, Result};
use midway_types::{
    Balance, NewTransaction, Transaction, TransactionKind, TransferOutcome, TransferRequest,
    DAILY_BONUS_AMOUNT, MIN_TRANSFER_AMOUNT, STARTING_COINS, STARTING_TICKETS,
};
use tracing::warn;

/// Mutation gateway: the only path through which balances change.
///
/// Every operation follows the same shape: validate, apply the optimistic
/// local update, perform the remote writes, and on any remote failure call
/// [`Ledger::refresh`] to discard the optimistic update before re-raising
/// the original error. Preconditions are checked before anything mutates;
/// the backend re-validates independently and remains the authority.
impl Ledger {
    /// Credit coins (purchases, grants).
    pub async fn add_coins(&self, amount: u64, description: &str) -> Result<Transaction> {
        self.credit_coins(amount, TransactionKind::Purchase, description)
            .await
    }

    /// Debit coins for a wager. Fails with [`Error::InsufficientCoins`]
    /// before any mutation when the balance does not cover `amount`.
    pub async fn subtract_coins(&self, amount: u64, description: &str) -> Result<Transaction> {
        if amount == 0 {
            return Err(Error::InvalidAmount);
        }
        let account_id = self.require_session()?;
        let balance = self.balance();
        if balance.coins < amount {
            return Err(Error::InsufficientCoins {
                have: balance.coins,
                need: amount,
            });
        }
        let next = Balance {
            coins: balance.coins - amount,
            tickets: balance.tickets,
        };
        let new = NewTransaction {
            account_id: account_id.to_string(),
            kind: TransactionKind::Wager,
            amount: -(amount as i64),
            description: description.to_string(),
            balance_after: next.coins,
            recipient: None,
            note: None,
        };
        self.apply_mutation(next, new).await
    }

    /// Credit tickets won in gameplay. A zero amount is accepted (a round
    /// can pay nothing) and still logged.
    pub async fn add_tickets(&self, amount: u64, description: &str) -> Result<Transaction> {
        let account_id = self.require_session()?;
        let balance = self.balance();
        let next = Balance {
            coins: balance.coins,
            tickets: balance.tickets.saturating_add(amount),
        };
        let new = NewTransaction {
            account_id: account_id.to_string(),
            kind: TransactionKind::Win,
            amount: amount as i64,
            description: description.to_string(),
            // Win rows snapshot the ticket total, not the coin total.
            balance_after: next.tickets,
            recipient: None,
            note: None,
        };
        self.apply_mutation(next, new).await
    }

    /// Exchange tickets for coins, atomically from the caller's perspective.
    pub async fn redeem_tickets(
        &self,
        ticket_amount: u64,
        coin_amount: u64,
        description: &str,
    ) -> Result<Transaction> {
        if ticket_amount == 0 {
            return Err(Error::InvalidAmount);
        }
        let account_id = self.require_session()?;
        let balance = self.balance();
        if balance.tickets < ticket_amount {
            return Err(Error::InsufficientTickets {
                have: balance.tickets,
                need: ticket_amount,
            });
        }
        let next = Balance {
            coins: balance.coins.saturating_add(coin_amount),
            tickets: balance.tickets - ticket_amount,
        };
        let new = NewTransaction {
            account_id: account_id.to_string(),
            kind: TransactionKind::Redemption,
            amount: coin_amount as i64,
            description: description.to_string(),
            balance_after: next.coins,
            recipient: None,
            note: None,
        };
        self.apply_mutation(next, new).await
    }

    /// Send coins to another account through the server-side atomic transfer
    /// procedure. The client fast-fails on obvious validation errors; the
    /// procedure re-validates everything and its own validation failures
    /// surface verbatim as [`Error::Transfer`].
    pub async fn transfer_coins(
        &self,
        amount: u64,
        recipient: &str,
        description: &str,
        note: Option<&str>,
    ) -> Result<TransferOutcome> {
        let account_id = self.require_session()?;
        if recipient.trim().is_empty() {
            return Err(Error::EmptyRecipient);
        }
        if amount < MIN_TRANSFER_AMOUNT {
            return Err(Error::BelowTransferMinimum {
                amount,
                min: MIN_TRANSFER_AMOUNT,
            });
        }
        let balance = self.balance();
        if balance.coins < amount {
            return Err(Error::InsufficientCoins {
                have: balance.coins,
                need: amount,
            });
        }

        let request = TransferRequest {
            sender_id: account_id.to_string(),
            recipient: recipient.to_string(),
            amount,
            description: description.to_string(),
            note: note.map(str::to_string),
        };
        match self.remote.transfer(&request).await {
            Ok(outcome) => {
                // The procedure already committed; adopt the balance it
                // returned, then pull the canonical transaction list.
                let stamp = self.store.next_stamp();
                self.store.apply_balance(
                    stamp,
                    Balance {
                        coins: outcome.new_sender_balance,
                        tickets: balance.tickets,
                    },
                );
                if let Err(err) = self.refresh().await {
                    warn!(%err, "post-transfer refresh failed");
                }
                Ok(outcome)
            }
            // Procedure-side validation rejected the transfer before any
            // mutation; nothing to reconcile.
            Err(err @ Error::Transfer(_)) => Err(err),
            Err(err) => Err(self.rollback(err).await),
        }
    }

    /// Convenience: credit the fixed daily bonus.
    pub async fn daily_bonus(&self) -> Result<Transaction> {
        self.credit_coins(DAILY_BONUS_AMOUNT, TransactionKind::DailyBonus, "daily bonus")
            .await
    }

    /// Re-seed the remote record to the starting balances, then resync.
    pub async fn reset_balances(&self) -> Result<()> {
        let account_id = self.require_session()?;
        self.remote
            .upsert_balance(account_id, STARTING_COINS, STARTING_TICKETS)
            .await?;
        self.refresh().await
    }

    async fn credit_coins(
        &self,
        amount: u64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(Error::InvalidAmount);
        }
        let account_id = self.require_session()?;
        let balance = self.balance();
        let next = Balance {
            coins: balance.coins.saturating_add(amount),
            tickets: balance.tickets,
        };
        let new = NewTransaction {
            account_id: account_id.to_string(),
            kind,
            amount: amount as i64,
            description: description.to_string(),
            balance_after: next.coins,
            recipient: None,
            note: None,
        };
        self.apply_mutation(next, new).await
    }

    fn require_session(&self) -> Result<&str> {
        self.session
            .as_ref()
            .map(|s| s.account_id.as_str())
            .ok_or(Error::NoSession)
    }

    /// Optimistic apply, then the two remote writes. On failure the
    /// optimistic update is rolled back by refreshing to ground truth and
    /// the original error re-raised.
    async fn apply_mutation(&self, next: Balance, new: NewTransaction) -> Result<Transaction> {
        let account_id = new.account_id.clone();
        let stamp = self.store.next_stamp();
        self.store.apply_balance(stamp, next);
        match self.commit(&account_id, next, &new).await {
            Ok(transaction) => {
                self.store.record_transaction(transaction.clone());
                self.store.mark_synced(now_millis());
                Ok(transaction)
            }
            Err(err) => Err(self.rollback(err).await),
        }
    }

    async fn commit(
        &self,
        account_id: &str,
        next: Balance,
        new: &NewTransaction,
    ) -> Result<Transaction> {
        self.remote
            .upsert_balance(account_id, next.coins, next.tickets)
            .await?;
        self.remote.insert_transaction(new).await
    }

    /// One reconciliation attempt, then the original error back to the
    /// caller so the UI can report that the action did not complete.
    async fn rollback(&self, err: Error) -> Error {
        if let Err(refresh_err) = self.refresh().await {
            warn!(%refresh_err, "rollback refresh failed");
        }
        err
    }
}
