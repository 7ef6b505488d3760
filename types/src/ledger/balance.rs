use super::{STARTING_COINS, STARTING_TICKETS};
use serde::{Deserialize, Serialize};

/// Spendable state of one account as seen by consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub coins: u64,
    pub tickets: u64,
}

impl Balance {
    pub fn starting() -> Self {
        Self {
            coins: STARTING_COINS,
            tickets: STARTING_TICKETS,
        }
    }
}

/// Balance row as stored by the backend, keyed by account id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub account_id: String,
    pub coins: u64,
    pub tickets: u64,
    /// Unix millis of the last authoritative write.
    pub updated_at: u64,
}

impl BalanceRecord {
    pub fn balance(&self) -> Balance {
        Balance {
            coins: self.coins,
            tickets: self.tickets,
        }
    }
}
