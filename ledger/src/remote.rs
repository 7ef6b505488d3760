use crate::{events::Stream, Error, Result};
use midway_types::{
    BalanceRecord, NewTransaction, Transaction, TransferFailure, TransferOutcome, TransferRequest,
    Update, UpsertBalance,
};
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use url::Url;

/// Timeout for connections and requests
const TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for transient HTTP failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request (including the first attempt).
    pub max_attempts: usize,
    /// Initial backoff delay after the first retryable failure.
    pub initial_backoff: Duration,
    /// Maximum backoff delay between attempts.
    pub max_backoff: Duration,
    /// Whether non-idempotent requests (e.g., POST) may be retried.
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

/// Remote persistence adapter: the authoritative backing store, reachable
/// only while a session exists.
#[derive(Clone)]
pub struct RemoteStore {
    pub base_url: Url,
    pub ws_url: Url,
    pub http_client: HttpClient,

    retry_policy: RetryPolicy,
}

impl RemoteStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;

        // Convert http(s) to ws(s) for WebSocket URL
        let ws_scheme = match base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            scheme => {
                return Err(Error::InvalidScheme(scheme.to_string()));
            }
        };

        let mut ws_url = base_url.clone();
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(ws_scheme.to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url,
            ws_url,
            http_client,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Returns a copy of the current retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Sets the retry policy for subsequent HTTP requests.
    pub fn set_retry_policy(&mut self, retry_policy: RetryPolicy) {
        self.retry_policy = retry_policy;
    }

    /// Returns a new store with the provided retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response> {
        self.send_with_retry(reqwest::Method::GET, || self.http_client.get(url.clone()))
            .await
    }

    async fn post_json_with_retry<B: Serialize>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<reqwest::Response> {
        self.send_with_retry(reqwest::Method::POST, || {
            self.http_client.post(url.clone()).json(body)
        })
        .await
    }

    async fn send_with_retry(
        &self,
        method: reqwest::Method,
        make_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let max_attempts =
            if method == reqwest::Method::GET || self.retry_policy.retry_non_idempotent {
                self.retry_policy.max_attempts.max(1)
            } else {
                1
            };

        let mut attempt = 0usize;
        let mut backoff = self.retry_policy.initial_backoff;
        loop {
            attempt += 1;
            let result = make_request().send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || attempt >= max_attempts {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable_error(&err) {
                        return Err(Error::Reqwest(err));
                    }
                }
            }

            if backoff > Duration::ZERO {
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), self.retry_policy.max_backoff);
            }
        }
    }

    /// Read the balance record for an account. A missing record is not an
    /// error; it signals first use and triggers seeding in the caller.
    pub async fn fetch_balance(&self, account_id: &str) -> Result<Option<BalanceRecord>> {
        let url = self.base_url.join(&format!("balance/{account_id}"))?;
        let response = self.get_with_retry(url).await?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(Some(response.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Error::Failed(response.status())),
        }
    }

    /// Full replace of the coins/tickets pair, conflict target = account id.
    pub async fn upsert_balance(&self, account_id: &str, coins: u64, tickets: u64) -> Result<()> {
        let url = self.base_url.join(&format!("balance/{account_id}"))?;
        debug!(account_id, coins, tickets, "upserting balance");
        let response = self
            .post_json_with_retry(url, &UpsertBalance { coins, tickets })
            .await?;
        if !response.status().is_success() {
            return Err(Error::Failed(response.status()));
        }
        Ok(())
    }

    /// Insert a transaction record; the created record (id and timestamp
    /// assigned server-side) is returned.
    pub async fn insert_transaction(&self, new: &NewTransaction) -> Result<Transaction> {
        let url = self.base_url.join("transactions")?;
        let response = self.post_json_with_retry(url, new).await?;
        if !response.status().is_success() {
            return Err(Error::Failed(response.status()));
        }
        Ok(response.json().await?)
    }

    /// The `limit` most recent transactions, ordered by creation time
    /// descending.
    pub async fn recent_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let mut url = self.base_url.join(&format!("transactions/{account_id}"))?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        let response = self.get_with_retry(url).await?;
        if !response.status().is_success() {
            return Err(Error::Failed(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Invoke the server-side atomic transfer procedure. Validation failures
    /// reported by the procedure surface verbatim as [`Error::Transfer`].
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let url = self.base_url.join("transfer")?;
        let response = self.post_json_with_retry(url, request).await?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(response.json().await?),
            reqwest::StatusCode::UNPROCESSABLE_ENTITY => {
                let failure: TransferFailure = response.json().await?;
                Err(Error::Transfer(failure.error))
            }
            status => Err(Error::Failed(status)),
        }
    }

    /// Connect to the per-account updates stream.
    pub async fn subscribe_updates(&self, account_id: &str) -> Result<Stream<Update>> {
        let ws_url = self.ws_url.join(&format!("updates/{account_id}"))?;
        info!(ws_url = %ws_url, account_id, "Connecting to updates WebSocket");

        let (ws_stream, _) = timeout(TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| Error::DialTimeout)??;
        info!("WebSocket connected");

        Ok(Stream::new(ws_stream))
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    use reqwest::StatusCode;
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}
