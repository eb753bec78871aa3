//! Wallet daemon REST client
//!
//! Low-level HTTP client for the external Lightning wallet daemon. One
//! instance corresponds to one verified connection; callers go through
//! [`crate::node::WalletHandle`], which owns the retry policies and the
//! connection lifecycle.

use crate::{config::WalletConfig, idempotency::IssuedInvoice, PaywallError, PaywallResult};
use serde::Deserialize;
use tracing::{debug, error, info};

/// Map a transport-level failure onto the paywall error taxonomy.
///
/// Connectivity problems are transient and retryable; everything else
/// surfaces as-is.
fn map_http_error(e: reqwest::Error) -> PaywallError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        PaywallError::Unavailable(format!("wallet daemon request failed: {}", e))
    } else {
        PaywallError::InvalidRequest(format!("wallet daemon rejected request: {}", e))
    }
}

/// Map a non-success HTTP status onto the paywall error taxonomy
fn map_status_error(status: reqwest::StatusCode, body: String) -> PaywallError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        PaywallError::Unavailable(format!("wallet daemon returned {}: {}", status, body))
    } else {
        PaywallError::InvalidRequest(format!("wallet daemon returned {}: {}", status, body))
    }
}

/// Wallet daemon node information
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    /// Node public key
    pub node_id: String,
    /// Network the node runs on (mainnet, testnet, signet, regtest)
    #[serde(default)]
    pub network: String,
    /// Current block height
    #[serde(default)]
    pub block_height: u32,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    invoice: String,
    payment_hash: String,
}

#[derive(Debug, Deserialize)]
struct CreateOfferResponse {
    offer: String,
}

/// REST client for the wallet daemon
pub struct WalletClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl WalletClient {
    /// Connect to the wallet daemon and verify it responds.
    ///
    /// "Connecting" here means building the HTTP client and probing the info
    /// endpoint; the daemon holds the actual Lightning state.
    pub async fn connect(config: &WalletConfig) -> PaywallResult<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!("Connecting to wallet daemon at {}", base_url);

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| PaywallError::Config(format!("failed to build HTTP client: {}", e)))?;

        let client = Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
        };

        let info = client.node_info().await?;
        info!(
            "Connected to wallet daemon: node_id={}, network={}",
            info.node_id, info.network
        );

        Ok(client)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> PaywallResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body));
        }
        response.json::<T>().await.map_err(|e| {
            error!("Failed to decode wallet daemon response: {}", e);
            PaywallError::Unavailable(format!("malformed wallet daemon response: {}", e))
        })
    }

    /// Get node information from the daemon
    pub async fn node_info(&self) -> PaywallResult<NodeInfo> {
        debug!("Getting wallet node info");
        let response = self
            .request(reqwest::Method::GET, "/v1/info")
            .send()
            .await
            .map_err(map_http_error)?;
        self.check(response).await
    }

    /// Create a BOLT11 invoice
    pub async fn create_invoice(
        &self,
        amount_sat: u64,
        description: &str,
        expiry_secs: u32,
    ) -> PaywallResult<IssuedInvoice> {
        debug!(
            "Creating invoice (amount: {} sat, description: {}, expiry: {}s)",
            amount_sat, description, expiry_secs
        );

        let response = self
            .request(reqwest::Method::POST, "/v1/invoices")
            .json(&serde_json::json!({
                "amount_sat": amount_sat,
                "description": description,
                "expiry_seconds": expiry_secs,
            }))
            .send()
            .await
            .map_err(map_http_error)?;

        let created: CreateInvoiceResponse = self.check(response).await?;
        info!(
            "Created invoice: payment_hash={}, amount={} sat",
            created.payment_hash, amount_sat
        );

        Ok(IssuedInvoice {
            invoice: created.invoice,
            payment_hash: created.payment_hash,
        })
    }

    /// Create a reusable BOLT12 offer
    pub async fn create_offer(&self, amount_sat: u64, description: &str) -> PaywallResult<String> {
        debug!(
            "Creating offer (amount: {} sat, description: {})",
            amount_sat, description
        );

        let response = self
            .request(reqwest::Method::POST, "/v1/offers")
            .json(&serde_json::json!({
                "amount_sat": amount_sat,
                "description": description,
            }))
            .send()
            .await
            .map_err(map_http_error)?;

        let created: CreateOfferResponse = self.check(response).await?;
        info!("Created offer ({} sat)", amount_sat);
        Ok(created.offer)
    }

    /// Register a webhook callback URL with the daemon
    pub async fn register_webhook(&self, url: &str) -> PaywallResult<()> {
        info!("Registering webhook callback: {}", url);

        let response = self
            .request(reqwest::Method::POST, "/v1/webhooks")
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body));
        }
        Ok(())
    }

    /// Open the daemon's long-lived settlement event stream.
    ///
    /// The daemon emits one JSON event per line; the returned response is
    /// consumed incrementally by the event listener.
    pub async fn open_event_stream(&self) -> PaywallResult<reqwest::Response> {
        debug!("Opening wallet daemon event stream");

        let response = self
            .request(reqwest::Method::GET, "/v1/events")
            // The stream is long-lived; the per-request timeout must not
            // apply to it.
            .timeout(std::time::Duration::from_secs(7 * 24 * 3600))
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body));
        }
        Ok(response)
    }
}
