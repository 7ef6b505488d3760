pub mod events;
mod gateway;
pub mod local;
pub mod remote;
pub mod store;
pub mod sync;

pub use events::Stream;
pub use local::LocalStore;
pub use remote::{RemoteStore, RetryPolicy};
pub use store::BalanceStore;
pub use sync::{Ledger, Session, SyncState};
use thiserror::Error;

/// Error type for ledger operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("invalid data: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("dial timeout")]
    DialTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no active session")]
    NoSession,
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error("insufficient coins: have {have}, need {need}")]
    InsufficientCoins { have: u64, need: u64 },
    #[error("insufficient tickets: have {have}, need {need}")]
    InsufficientTickets { have: u64, need: u64 },
    #[error("recipient must not be empty")]
    EmptyRecipient,
    #[error("transfer amount {amount} below minimum {min}")]
    BelowTransferMinimum { amount: u64, min: u64 },
    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;
