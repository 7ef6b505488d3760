use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State as AxumState},
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use midway_types::{
    BalanceRecord, NewTransaction, RecipientRef, Transaction, TransactionKind, TransferFailure,
    TransferOutcome, TransferRequest, Update, UpsertBalance, HISTORY_CAP, MIN_TRANSFER_AMOUNT,
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::broadcast;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

#[derive(Default)]
pub struct State {
    balances: HashMap<String, BalanceRecord>,
    /// Per-account logs, oldest first; served newest first.
    transactions: HashMap<String, Vec<Transaction>>,
    /// Known accounts for recipient resolution (by id or contact email).
    directory: HashMap<String, RecipientRef>,
    last_ts: u64,
    fail_writes: bool,
    fail_next_reads: u32,
    fail_next_writes: u32,
}

impl State {
    /// Strictly monotonic unix-millis timestamps, so creation order is a
    /// total order even within one millisecond.
    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_ts = now.max(self.last_ts + 1);
        self.last_ts
    }

    fn resolve_recipient(&self, needle: &str) -> Option<RecipientRef> {
        if let Some(entry) = self.directory.get(needle) {
            return Some(entry.clone());
        }
        if let Some(entry) = self
            .directory
            .values()
            .find(|r| r.contact_email.as_deref() == Some(needle))
        {
            return Some(entry.clone());
        }
        // Any account with a balance record is addressable by id.
        if self.balances.contains_key(needle) {
            return Some(RecipientRef {
                account_id: needle.to_string(),
                display_name: needle.to_string(),
                contact_email: None,
            });
        }
        None
    }

    fn counterparty_ref(&self, account_id: &str) -> RecipientRef {
        self.directory
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| RecipientRef {
                account_id: account_id.to_string(),
                display_name: account_id.to_string(),
                contact_email: None,
            })
    }
}

/// In-memory backend: authoritative balance rows, append-only transaction
/// logs, and a broadcast channel feeding the per-account update streams.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<RwLock<State>>,
    update_tx: broadcast::Sender<(String, Update)>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            update_tx,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make an account addressable by id (and optionally contact email) for
    /// the transfer procedure.
    pub fn register_account(
        &self,
        account_id: &str,
        display_name: &str,
        contact_email: Option<&str>,
    ) {
        let mut state = self.write();
        state.directory.insert(
            account_id.to_string(),
            RecipientRef {
                account_id: account_id.to_string(),
                display_name: display_name.to_string(),
                contact_email: contact_email.map(str::to_string),
            },
        );
    }

    /// When set, write endpoints answer 503 so clients can exercise their
    /// rollback path.
    pub fn set_fail_writes(&self, fail: bool) {
        self.write().fail_writes = fail;
    }

    pub fn fail_writes(&self) -> bool {
        self.read().fail_writes
    }

    /// Answer 503 to the next `n` read requests, then recover. Lets clients
    /// exercise their retry policy against a transient failure.
    pub fn fail_next_reads(&self, n: u32) {
        self.write().fail_next_reads = n;
    }

    /// Answer 503 to the next `n` write requests, then recover.
    pub fn fail_next_writes(&self, n: u32) {
        self.write().fail_next_writes = n;
    }

    fn take_read_failure(&self) -> bool {
        let mut state = self.write();
        if state.fail_next_reads > 0 {
            state.fail_next_reads -= 1;
            return true;
        }
        false
    }

    fn take_write_failure(&self) -> bool {
        let mut state = self.write();
        if state.fail_writes {
            return true;
        }
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return true;
        }
        false
    }

    pub fn balance(&self, account_id: &str) -> Option<BalanceRecord> {
        self.read().balances.get(account_id).cloned()
    }

    pub fn upsert_balance(&self, account_id: &str, upsert: UpsertBalance) -> BalanceRecord {
        let record = {
            let mut state = self.write();
            let record = BalanceRecord {
                account_id: account_id.to_string(),
                coins: upsert.coins,
                tickets: upsert.tickets,
                updated_at: state.next_timestamp(),
            };
            state
                .balances
                .insert(account_id.to_string(), record.clone());
            record
        }; // Release lock before broadcasting
        self.broadcast(account_id, Update::Balance(record.clone()));
        record
    }

    pub fn insert_transaction(&self, new: NewTransaction) -> Transaction {
        let transaction = {
            let mut state = self.write();
            let transaction = Transaction {
                id: Uuid::new_v4(),
                account_id: new.account_id,
                kind: new.kind,
                amount: new.amount,
                description: new.description,
                balance_after: new.balance_after,
                recipient: new.recipient,
                note: new.note,
                created_at: state.next_timestamp(),
            };
            state
                .transactions
                .entry(transaction.account_id.clone())
                .or_default()
                .push(transaction.clone());
            transaction
        };
        self.broadcast(
            &transaction.account_id,
            Update::Transaction(transaction.clone()),
        );
        transaction
    }

    pub fn recent_transactions(&self, account_id: &str, limit: usize) -> Vec<Transaction> {
        let state = self.read();
        state
            .transactions
            .get(account_id)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// The atomic transfer procedure: validates recipient and sender, moves
    /// the coins, and writes both transaction rows under one lock. The Err
    /// message is the validation failure surfaced verbatim to callers.
    pub fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome, String> {
        let (outcome, broadcasts) = {
            let mut state = self.write();
            let recipient = state
                .resolve_recipient(&request.recipient)
                .ok_or_else(|| "recipient not found".to_string())?;
            if recipient.account_id == request.sender_id {
                return Err("cannot transfer to self".to_string());
            }
            if request.amount < MIN_TRANSFER_AMOUNT {
                return Err(format!("amount below minimum of {MIN_TRANSFER_AMOUNT}"));
            }
            let sender = state
                .balances
                .get(&request.sender_id)
                .cloned()
                .ok_or_else(|| "sender not found".to_string())?;
            if sender.coins < request.amount {
                return Err("insufficient funds".to_string());
            }

            let sender_ref = state.counterparty_ref(&request.sender_id);
            let ts = state.next_timestamp();
            let sender_record = BalanceRecord {
                coins: sender.coins - request.amount,
                updated_at: ts,
                ..sender
            };
            state
                .balances
                .insert(request.sender_id.clone(), sender_record.clone());

            let prior = state
                .balances
                .get(&recipient.account_id)
                .cloned()
                .unwrap_or(BalanceRecord {
                    account_id: recipient.account_id.clone(),
                    coins: 0,
                    tickets: 0,
                    updated_at: ts,
                });
            let recipient_record = BalanceRecord {
                coins: prior.coins + request.amount,
                updated_at: ts,
                ..prior
            };
            state
                .balances
                .insert(recipient.account_id.clone(), recipient_record.clone());

            let sender_tx = Transaction {
                id: Uuid::new_v4(),
                account_id: request.sender_id.clone(),
                kind: TransactionKind::TransferOut,
                amount: -(request.amount as i64),
                description: request.description.clone(),
                balance_after: sender_record.coins,
                recipient: Some(recipient.clone()),
                note: request.note.clone(),
                created_at: state.next_timestamp(),
            };
            let recipient_tx = Transaction {
                id: Uuid::new_v4(),
                account_id: recipient.account_id.clone(),
                kind: TransactionKind::TransferIn,
                amount: request.amount as i64,
                description: request.description.clone(),
                balance_after: recipient_record.coins,
                recipient: Some(sender_ref),
                note: request.note.clone(),
                created_at: state.next_timestamp(),
            };
            for tx in [&sender_tx, &recipient_tx] {
                state
                    .transactions
                    .entry(tx.account_id.clone())
                    .or_default()
                    .push(tx.clone());
            }

            let outcome = TransferOutcome {
                new_sender_balance: sender_record.coins,
                recipient: recipient.clone(),
                amount: request.amount,
                note: request.note.clone(),
            };
            let broadcasts = vec![
                (request.sender_id.clone(), Update::Balance(sender_record)),
                (request.sender_id.clone(), Update::Transaction(sender_tx)),
                (
                    recipient.account_id.clone(),
                    Update::Balance(recipient_record),
                ),
                (
                    recipient.account_id.clone(),
                    Update::Transaction(recipient_tx),
                ),
            ];
            (outcome, broadcasts)
        }; // Release lock before broadcasting
        for (account, update) in broadcasts {
            self.broadcast(&account, update);
        }
        Ok(outcome)
    }

    pub fn update_subscriber(&self) -> broadcast::Receiver<(String, Update)> {
        self.update_tx.subscribe()
    }

    fn broadcast(&self, account: &str, update: Update) {
        if let Err(err) = self.update_tx.send((account.to_string(), update)) {
            tracing::debug!(%err, "no update subscribers");
        }
    }
}

pub struct Api {
    simulator: Arc<Simulator>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    pub fn router(&self) -> Router {
        // Configure CORS
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        // Configure Rate Limiting
        // Maximize throughput for local sims: allow ~1M req/s with a large burst
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_nanosecond(1)
                .burst_size(2_000_000)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .unwrap(),
        );

        Router::new()
            .route("/balance/:account", get(get_balance).post(post_balance))
            .route("/transactions", post(post_transaction))
            .route("/transactions/:account", get(get_transactions))
            .route("/transfer", post(post_transfer))
            .route("/updates/:account", get(updates_ws))
            .layer(cors)
            .layer(GovernorLayer {
                config: governor_conf,
            })
            .with_state(self.simulator.clone())
    }
}

async fn get_balance(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    if simulator.take_read_failure() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match simulator.balance(&account) {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_balance(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(account): Path<String>,
    Json(upsert): Json<UpsertBalance>,
) -> impl IntoResponse {
    if simulator.take_write_failure() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    (StatusCode::OK, Json(simulator.upsert_balance(&account, upsert))).into_response()
}

async fn post_transaction(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(new): Json<NewTransaction>,
) -> impl IntoResponse {
    if simulator.take_write_failure() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    (StatusCode::OK, Json(simulator.insert_transaction(new))).into_response()
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn get_transactions(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(account): Path<String>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    if simulator.take_read_failure() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let limit = params.limit.unwrap_or(HISTORY_CAP);
    Json(simulator.recent_transactions(&account, limit)).into_response()
}

async fn post_transfer(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<TransferRequest>,
) -> impl IntoResponse {
    if simulator.take_write_failure() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match simulator.transfer(&request) {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(error) => {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(TransferFailure { error }),
            )
                .into_response()
        }
    }
}

async fn updates_ws(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(account): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_updates_ws(socket, simulator, account))
}

async fn handle_updates_ws(
    socket: axum::extract::ws::WebSocket,
    simulator: Arc<Simulator>,
    account: String,
) {
    tracing::info!(account, "Updates WebSocket connected");
    let (mut sender, mut receiver) = socket.split();
    let mut updates = simulator.update_subscriber();

    loop {
        tokio::select! {
            // Handle incoming WebSocket messages (ping/pong/close)
            msg = receiver.next() => {
                match msg {
                    Some(Ok(axum::extract::ws::Message::Close(_))) => {
                        tracing::info!("Client closed WebSocket connection");
                        break;
                    }
                    Some(Ok(axum::extract::ws::Message::Ping(data))) => {
                        if sender.send(axum::extract::ws::Message::Pong(data)).await.is_err() {
                            tracing::warn!("Failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {:?}", e);
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                    _ => {} // Ignore other message types
                }
            }
            // Handle broadcast updates
            update_result = updates.recv() => {
                match update_result {
                    Ok((target, update)) => {
                        if target != account {
                            continue;
                        }
                        let frame = match serde_json::to_string(&update) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::error!("Failed to encode update: {}", e);
                                continue;
                            }
                        };
                        if sender
                            .send(axum::extract::ws::Message::Text(frame))
                            .await
                            .is_err()
                        {
                            tracing::warn!("Failed to send update, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "WebSocket client lagged behind, skipped {} messages. Consider increasing buffer size.",
                            skipped
                        );
                        // Continue receiving - client may catch up
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Broadcast channel closed");
                        break;
                    }
                }
            }
        }
    }
    tracing::info!("Updates WebSocket handler exiting");
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_transaction(account_id: &str, amount: i64, balance_after: u64) -> NewTransaction {
        NewTransaction {
            account_id: account_id.to_string(),
            kind: if amount >= 0 {
                TransactionKind::Purchase
            } else {
                TransactionKind::Wager
            },
            amount,
            description: "test".to_string(),
            balance_after,
            recipient: None,
            note: None,
        }
    }

    #[test]
    fn test_upsert_balance_broadcasts() {
        let simulator = Simulator::new();
        let mut updates = simulator.update_subscriber();

        let record = simulator.upsert_balance(
            "alice",
            UpsertBalance {
                coins: 10_000,
                tickets: 0,
            },
        );
        assert_eq!(record.coins, 10_000);
        assert_eq!(simulator.balance("alice"), Some(record.clone()));
        assert_eq!(simulator.balance("bob"), None);

        let (account, update) = updates.try_recv().unwrap();
        assert_eq!(account, "alice");
        assert_eq!(update, Update::Balance(record));
    }

    #[test]
    fn test_transactions_ordered_and_limited() {
        let simulator = Simulator::new();
        for i in 0..5 {
            simulator.insert_transaction(new_transaction("alice", 100, 10_000 + (i + 1) * 100));
        }
        let recent = simulator.recent_transactions("alice", 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].balance_after, 10_500);
        for pair in recent.windows(2) {
            assert!(pair[0].created_at > pair[1].created_at);
        }
        assert!(simulator.recent_transactions("bob", 10).is_empty());
    }

    #[test]
    fn test_transfer_moves_coins_and_writes_both_rows() {
        let simulator = Simulator::new();
        simulator.register_account("alice", "Alice", Some("alice@example.com"));
        simulator.register_account("bob", "Bob", Some("bob@example.com"));
        simulator.upsert_balance(
            "alice",
            UpsertBalance {
                coins: 1_000,
                tickets: 5,
            },
        );
        simulator.upsert_balance(
            "bob",
            UpsertBalance {
                coins: 200,
                tickets: 0,
            },
        );

        let outcome = simulator
            .transfer(&TransferRequest {
                sender_id: "alice".to_string(),
                recipient: "bob@example.com".to_string(),
                amount: 300,
                description: "transfer to Bob".to_string(),
                note: Some("thanks".to_string()),
            })
            .unwrap();
        assert_eq!(outcome.new_sender_balance, 700);
        assert_eq!(outcome.recipient.account_id, "bob");
        assert_eq!(outcome.recipient.display_name, "Bob");

        assert_eq!(simulator.balance("alice").unwrap().coins, 700);
        assert_eq!(simulator.balance("bob").unwrap().coins, 500);
        // Tickets are untouched by transfers.
        assert_eq!(simulator.balance("alice").unwrap().tickets, 5);

        let sender_log = simulator.recent_transactions("alice", 10);
        assert_eq!(sender_log[0].kind, TransactionKind::TransferOut);
        assert_eq!(sender_log[0].amount, -300);
        assert_eq!(sender_log[0].balance_after, 700);
        assert_eq!(sender_log[0].note.as_deref(), Some("thanks"));
        assert_eq!(
            sender_log[0].recipient.as_ref().unwrap().display_name,
            "Bob"
        );

        let recipient_log = simulator.recent_transactions("bob", 10);
        assert_eq!(recipient_log[0].kind, TransactionKind::TransferIn);
        assert_eq!(recipient_log[0].amount, 300);
        assert_eq!(recipient_log[0].balance_after, 500);
        assert_eq!(
            recipient_log[0].recipient.as_ref().unwrap().display_name,
            "Alice"
        );
    }

    #[test]
    fn test_transfer_validation() {
        let simulator = Simulator::new();
        simulator.register_account("alice", "Alice", None);
        simulator.register_account("bob", "Bob", None);
        simulator.upsert_balance(
            "alice",
            UpsertBalance {
                coins: 100,
                tickets: 0,
            },
        );

        let request = |recipient: &str, amount: u64| TransferRequest {
            sender_id: "alice".to_string(),
            recipient: recipient.to_string(),
            amount,
            description: "test".to_string(),
            note: None,
        };

        assert_eq!(
            simulator.transfer(&request("nobody", 50)),
            Err("recipient not found".to_string())
        );
        assert_eq!(
            simulator.transfer(&request("alice", 50)),
            Err("cannot transfer to self".to_string())
        );
        assert_eq!(
            simulator.transfer(&request("bob", MIN_TRANSFER_AMOUNT - 1)),
            Err(format!("amount below minimum of {MIN_TRANSFER_AMOUNT}"))
        );
        assert_eq!(
            simulator.transfer(&request("bob", 500)),
            Err("insufficient funds".to_string())
        );
        // Nothing moved.
        assert_eq!(simulator.balance("alice").unwrap().coins, 100);
        assert!(simulator.recent_transactions("alice", 10).is_empty());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let simulator = Simulator::new();
        let mut last = 0;
        for i in 0..100 {
            let tx = simulator.insert_transaction(new_transaction("alice", 1, i));
            assert!(tx.created_at > last);
            last = tx.created_at;
        }
    }
}
