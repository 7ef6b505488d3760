use crate::ledger::{BalanceRecord, RecipientRef, Transaction, TransactionKind};
use serde::{Deserialize, Serialize};

/// Full-replace write of a balance record, conflict target = account id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertBalance {
    pub coins: u64,
    pub tickets: u64,
}

/// Transaction insert request. Id and timestamp are assigned server-side;
/// the created [`Transaction`] is returned in the response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub account_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: String,
    pub balance_after: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<RecipientRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Input to the server-side atomic transfer procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub sender_id: String,
    /// Account id or contact email of the destination account.
    pub recipient: String,
    pub amount: u64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Successful result of the transfer procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub new_sender_balance: u64,
    pub recipient: RecipientRef,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Validation failure returned by the transfer procedure. The message is
/// surfaced to the caller verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub error: String,
}

/// Push update delivered over the per-account updates stream.
///
/// Balance frames carry the new field values and are applied directly.
/// Transaction frames are a signal to re-fetch the recent-transactions
/// list; their payload is not otherwise trusted for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Update {
    Balance(BalanceRecord),
    Transaction(Transaction),
}
