//! Wallet daemon integration module
//!
//! This module owns the single connection to the external Lightning wallet
//! daemon. The connection is established lazily on first use and reused;
//! initialization runs at most once even under concurrent first callers,
//! because later callers await the same mutex-guarded init. All outbound
//! calls are wrapped in the retry policies from [`crate::RetryPolicy`].

use crate::config::Config;
use crate::db::Database;
use crate::dedup::EventDeduplicator;
use crate::hub::RealtimeHub;
use crate::idempotency::IssuedInvoice;
use crate::{PaywallError, PaywallResult, RetryPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod client;
mod events;

pub use client::{NodeInfo, WalletClient};
pub use events::SettlementEvent;

/// Punctuation accepted in invoice descriptions, alongside word characters
/// and whitespace. Invoice text reaches wallet UIs verbatim, so anything
/// outside this conservative allow-list is rejected.
const DESCRIPTION_PUNCTUATION: &str = ".,:;!?'\"()[]-_/@#&+%*";

/// Handle to the wallet daemon connection
pub struct WalletHandle {
    config: Arc<Config>,
    /// The single shared connection; None until first use or after loss
    client: Mutex<Option<Arc<WalletClient>>>,
    /// Non-blocking connection status for health checks
    connected: AtomicBool,
    /// Set once per connection lifetime by `register_webhook_once`
    webhook_registered: AtomicBool,
    /// Cancels the background event listener on shutdown
    shutdown: CancellationToken,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
    connect_policy: RetryPolicy,
    request_policy: RetryPolicy,
}

impl WalletHandle {
    /// Create a handle; no connection is attempted yet
    pub fn new(config: Arc<Config>) -> Self {
        let connect_policy = RetryPolicy::connect(&config.wallet);
        let request_policy = RetryPolicy::request(&config.wallet);
        Self {
            config,
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
            webhook_registered: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            listener: Mutex::new(None),
            connect_policy,
            request_policy,
        }
    }

    /// Establish the daemon connection if not already established
    pub async fn connect(&self) -> PaywallResult<()> {
        self.client().await.map(|_| ())
    }

    /// Get the shared client, connecting on first use.
    ///
    /// The mutex is held across the connect attempt, so concurrent first
    /// callers wait for the single in-flight initialization instead of
    /// racing a second one.
    pub(crate) async fn client(&self) -> PaywallResult<Arc<WalletClient>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let wallet_config = self.config.wallet.clone();
        let client = self
            .connect_policy
            .run("wallet connect", || WalletClient::connect(&wallet_config))
            .await?;

        let client = Arc::new(client);
        *slot = Some(client.clone());
        self.connected.store(true, Ordering::Release);
        Ok(client)
    }

    /// Drop the cached connection after a stream loss so the next call
    /// re-establishes it
    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut slot) = self.client.try_lock() {
            *slot = None;
        }
    }

    /// Non-blocking connection status probe
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Create a BOLT11 invoice for `amount_sat` with `description`
    pub async fn create_invoice(
        &self,
        amount_sat: u64,
        description: &str,
    ) -> PaywallResult<IssuedInvoice> {
        self.validate(amount_sat, description)?;

        let client = self.client().await?;
        let expiry = self.config.paywall.invoice_expiry_seconds;
        self.request_policy
            .run("create invoice", || {
                client.create_invoice(amount_sat, description, expiry)
            })
            .await
    }

    /// Create a reusable BOLT12 offer for `amount_sat` with `description`
    pub async fn create_offer(&self, amount_sat: u64, description: &str) -> PaywallResult<String> {
        self.validate(amount_sat, description)?;

        let client = self.client().await?;
        self.request_policy
            .run("create offer", || client.create_offer(amount_sat, description))
            .await
    }

    /// Register `url` as the daemon's webhook callback, at most once per
    /// connection lifetime. The URL must be absolute and HTTPS.
    pub async fn register_webhook_once(&self, url: &str) -> PaywallResult<()> {
        let parsed = url::Url::parse(url)
            .map_err(|e| PaywallError::InvalidRequest(format!("invalid webhook URL: {}", e)))?;
        if parsed.scheme() != "https" {
            return Err(PaywallError::InvalidRequest(format!(
                "webhook URL must be HTTPS, got {}",
                parsed.scheme()
            )));
        }

        if self.webhook_registered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let client = self.client().await?;
        let result = self
            .request_policy
            .run("register webhook", || client.register_webhook(url))
            .await;

        if result.is_err() {
            // Allow a later attempt
            self.webhook_registered.store(false, Ordering::Release);
        }
        result
    }

    /// Start the background settlement event listener
    pub fn start_event_listener(
        self: &Arc<Self>,
        db: Arc<Database>,
        dedup: Arc<EventDeduplicator>,
        hub: Arc<RealtimeHub>,
    ) {
        let wallet = self.clone();
        let cancel = self.shutdown.clone();
        let handle = tokio::spawn(events::run_listener(wallet, db, dedup, hub, cancel));

        // Synchronous: called once during startup before any contention
        if let Ok(mut listener) = self.listener.try_lock() {
            *listener = Some(handle);
        }
    }

    /// Tear down: cancel the event listener and release the connection.
    ///
    /// In-flight settlement handling gets a short grace period; after that
    /// it is abandoned and the daemon will redeliver.
    pub async fn stop(&self) {
        info!("Stopping wallet handle...");
        self.shutdown.cancel();

        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => info!("Event listener stopped cleanly"),
                Ok(Err(e)) => warn!("Event listener task panicked: {}", e),
                Err(_) => warn!("Event listener stop timed out, abandoning"),
            }
        }

        *self.client.lock().await = None;
        self.connected.store(false, Ordering::Release);
        self.webhook_registered.store(false, Ordering::Release);
        info!("Wallet handle stopped");
    }

    /// Validate amount and description against the configured limits and
    /// the description character allow-list
    fn validate(&self, amount_sat: u64, description: &str) -> PaywallResult<()> {
        let paywall = &self.config.paywall;

        if amount_sat < paywall.min_amount_sat {
            return Err(PaywallError::InvalidRequest(format!(
                "amount {} sat is below the minimum of {} sat",
                amount_sat, paywall.min_amount_sat
            )));
        }

        if amount_sat > paywall.max_amount_sat {
            return Err(PaywallError::InvalidRequest(format!(
                "amount {} sat exceeds the maximum of {} sat",
                amount_sat, paywall.max_amount_sat
            )));
        }

        if description.trim().is_empty() {
            return Err(PaywallError::InvalidRequest(
                "description cannot be empty".to_string(),
            ));
        }

        if description.chars().count() > paywall.max_description_length {
            return Err(PaywallError::InvalidRequest(format!(
                "description exceeds {} characters",
                paywall.max_description_length
            )));
        }

        if let Some(bad) = description.chars().find(|c| {
            !(c.is_alphanumeric() || c.is_whitespace() || DESCRIPTION_PUNCTUATION.contains(*c))
        }) {
            return Err(PaywallError::InvalidRequest(format!(
                "description contains disallowed character {:?}",
                bad
            )));
        }

        Ok(())
    }
}
