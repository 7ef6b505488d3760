use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of balance-affecting event a transaction records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Wager,
    Win,
    Redemption,
    TransferIn,
    TransferOut,
    DailyBonus,
}

/// Structured counterparty reference attached to transfer transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRef {
    pub account_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

/// Immutable record of one balance-affecting event.
///
/// `amount` is signed relative to the currency the event affects: credits
/// are positive, debits negative. `balance_after` is the resulting balance
/// snapshot, denormalized for display (coin total for coin events, ticket
/// total for wins).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Assigned by the backend on insert.
    pub id: Uuid,
    pub account_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: String,
    pub balance_after: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<RecipientRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Unix millis, assigned by the backend on insert.
    pub created_at: u64,
}
