use crate::Result;
use midway_types::{Balance, Transaction};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Fixed keys scoped to the device/app installation.
pub const KEY_COINS: &str = "coins";
pub const KEY_TICKETS: &str = "tickets";
pub const KEY_TRANSACTIONS: &str = "transactions";

/// String-keyed fallback store used when no session exists or remote access
/// fails. Persisted as a single JSON map on disk; access is modeled as async
/// for interface uniformity with the remote store.
pub struct LocalStore {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, String>>,
}

impl LocalStore {
    /// Store without a backing file. Contents last for the process lifetime.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Opens (or creates) a file-backed store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(%err, path = %path.display(), "discarding unreadable local store");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    pub async fn set(&self, key: &str, value: String) -> Result<()> {
        let serialized = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.insert(key.to_string(), value);
            serde_json::to_vec_pretty(&*entries)?
        };
        if let Some(path) = &self.path {
            tokio::fs::write(path, serialized).await?;
        }
        Ok(())
    }

    /// Persisted balance, or `None` when this installation has never synced.
    pub async fn load_balance(&self) -> Result<Option<Balance>> {
        let coins = self.get(KEY_COINS).await?;
        let tickets = self.get(KEY_TICKETS).await?;
        if coins.is_none() && tickets.is_none() {
            return Ok(None);
        }
        // Unparseable values are treated as absent rather than fatal.
        Ok(Some(Balance {
            coins: coins.and_then(|c| c.parse().ok()).unwrap_or(0),
            tickets: tickets.and_then(|t| t.parse().ok()).unwrap_or(0),
        }))
    }

    pub async fn store_balance(&self, balance: Balance) -> Result<()> {
        self.set(KEY_COINS, balance.coins.to_string()).await?;
        self.set(KEY_TICKETS, balance.tickets.to_string()).await
    }

    pub async fn load_transactions(&self) -> Result<Vec<Transaction>> {
        match self.get(KEY_TRANSACTIONS).await? {
            Some(serialized) => match serde_json::from_str(&serialized) {
                Ok(transactions) => Ok(transactions),
                Err(err) => {
                    warn!(%err, "discarding unreadable local transaction list");
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    pub async fn store_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        self.set(KEY_TRANSACTIONS, serde_json::to_string(transactions)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midway_types::TransactionKind;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_get_set_round_trip() {
        let store = LocalStore::in_memory();
        assert_eq!(store.get(KEY_COINS).await.unwrap(), None);
        store.set(KEY_COINS, "1234".to_string()).await.unwrap();
        assert_eq!(
            store.get(KEY_COINS).await.unwrap(),
            Some("1234".to_string())
        );
    }

    #[tokio::test]
    async fn test_balance_absent_until_stored() {
        let store = LocalStore::in_memory();
        assert_eq!(store.load_balance().await.unwrap(), None);

        let balance = Balance {
            coins: 9_500,
            tickets: 12,
        };
        store.store_balance(balance).await.unwrap();
        assert_eq!(store.load_balance().await.unwrap(), Some(balance));
    }

    #[tokio::test]
    async fn test_file_backed_reload() {
        let path = std::env::temp_dir().join(format!("midway-local-{}.json", Uuid::new_v4()));

        let store = LocalStore::open(&path).await.unwrap();
        store
            .store_balance(Balance {
                coins: 777,
                tickets: 3,
            })
            .await
            .unwrap();
        let transactions = vec![Transaction {
            id: Uuid::new_v4(),
            account_id: "acct".to_string(),
            kind: TransactionKind::Wager,
            amount: -50,
            description: "bet".to_string(),
            balance_after: 727,
            recipient: None,
            note: None,
            created_at: 1,
        }];
        store.store_transactions(&transactions).await.unwrap();
        drop(store);

        let reloaded = LocalStore::open(&path).await.unwrap();
        assert_eq!(
            reloaded.load_balance().await.unwrap(),
            Some(Balance {
                coins: 777,
                tickets: 3,
            })
        );
        assert_eq!(reloaded.load_transactions().await.unwrap(), transactions);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_corrupt_values_treated_as_defaults() {
        let store = LocalStore::in_memory();
        store.set(KEY_COINS, "not a number".to_string()).await.unwrap();
        store.set(KEY_TRANSACTIONS, "{broken".to_string()).await.unwrap();
        assert_eq!(
            store.load_balance().await.unwrap(),
            Some(Balance {
                coins: 0,
                tickets: 0,
            })
        );
        assert!(store.load_transactions().await.unwrap().is_empty());
    }
}
