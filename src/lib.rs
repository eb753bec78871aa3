//! ln-paywall: gate content behind a Lightning micropayment
//!
//! This crate implements the payment-lifecycle engine for a Lightning
//! paywall:
//!
//! - **Wallet client**: a resilient client to an external Lightning wallet
//!   daemon that creates BOLT11 invoices and BOLT12 offers over a single
//!   lazily-established connection
//! - **Settlement pipeline**: deduplicated confirmation of payments arriving
//!   as in-process daemon events or signed HTTP webhooks
//! - **Payment state store**: a durable table of payment records keyed by
//!   payment hash, with monotonic status transitions
//! - **Realtime hub**: per-session event queues drained by a long-lived SSE
//!   connection, so the paying browser learns about settlement without polling
//! - **Access gate**: the read-only allow/deny decision for protected content
//!
//! # Architecture
//!
//! 1. A request for access issues an invoice (idempotency map → wallet
//!    client → retry policies) and records a Pending payment
//! 2. Settlement arrives as a daemon event or a webhook call; both paths go
//!    through the event deduplicator, then update payment state to Paid,
//!    then push to the realtime hub
//! 3. The access gate and the realtime hub are the only consumers of payment
//!    state for decision-making; the push channel is a latency optimization,
//!    never the source of truth
//!
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod db;
pub mod dedup;
pub mod gate;
pub mod hub;
pub mod idempotency;
pub mod node;
pub mod ratelimit;
pub mod settlement;

mod retry;

pub use retry::RetryPolicy;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

pub use config::Config;
use db::Database;
use dedup::EventDeduplicator;
use gate::AccessGate;
use hub::RealtimeHub;
use idempotency::IdempotencyMap;
use node::WalletHandle;
use ratelimit::RateLimiter;

/// The main paywall application state
#[derive(Clone)]
pub struct PaywallApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Handle to the external wallet daemon
    pub wallet: Arc<WalletHandle>,
    /// Database connection
    pub db: Arc<Database>,
    /// Settlement event deduplicator
    pub dedup: Arc<EventDeduplicator>,
    /// Per-session realtime event hub
    pub hub: Arc<RealtimeHub>,
    /// Invoice-creation idempotency map
    pub idempotency: Arc<IdempotencyMap>,
    /// Request rate limiter
    pub limiter: Arc<RateLimiter>,
    /// Content access gate
    pub gate: Arc<AccessGate>,
}

impl PaywallApp {
    /// Create a new paywall application instance
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing ln-paywall application...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Arc::new(Database::connect(&db_url).await?);
        info!("Database connected successfully");

        let wallet = Arc::new(WalletHandle::new(config.clone()));
        let dedup = Arc::new(EventDeduplicator::new(config.paywall.dedup_ttl()));
        let hub = Arc::new(RealtimeHub::new());
        let idempotency = Arc::new(IdempotencyMap::new(db.clone()));
        let limiter = Arc::new(RateLimiter::new());
        let gate = Arc::new(AccessGate::new(db.clone()));

        info!("ln-paywall application initialized successfully");

        Ok(Self { config, wallet, db, dedup, hub, idempotency, limiter, gate })
    }

    /// Start the paywall application
    pub async fn run(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        // Keep the sender alive so the shutdown signal never fires
        std::mem::forget(tx);
        self.run_with_shutdown(rx).await
    }

    /// Start the paywall application with a shutdown signal
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting ln-paywall application...");

        // Establish the wallet connection eagerly so startup fails fast, and
        // register our webhook callback with the daemon. The connection is
        // re-established lazily if this fails.
        match self.wallet.connect().await {
            Ok(()) => {
                info!("Wallet daemon connection established");
                if let Some(url) = self.config.webhook_callback_url() {
                    if let Err(e) = self.wallet.register_webhook_once(&url).await {
                        error!("Failed to register webhook with wallet daemon: {}", e);
                    }
                }
            }
            Err(e) => {
                // Degraded start: invoice creation will retry the connection.
                error!("Wallet daemon unreachable at startup: {}", e);
            }
        }

        // Consume the daemon's settlement event stream in the background.
        self.wallet.start_event_listener(
            self.db.clone(),
            self.dedup.clone(),
            self.hub.clone(),
        );

        let api_handle = tokio::spawn({
            let app = self.clone();
            async move {
                if let Err(e) = api::serve_with_shutdown(app, shutdown_rx).await {
                    error!("API server error: {}", e);
                }
            }
        });

        info!(
            "ln-paywall running. API available at http://{}",
            self.config.api.bind_address
        );

        api_handle.await?;

        Ok(())
    }

    /// Shutdown the application gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down ln-paywall application...");

        self.wallet.stop().await;
        self.db.close().await;

        info!("ln-paywall shutdown complete");
        Ok(())
    }
}

/// Error types for paywall operations
#[derive(thiserror::Error, Debug)]
pub enum PaywallError {
    /// The caller supplied an invalid amount, description or parameter
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A record with the same primary key already exists, or a state
    /// transition was attempted that the status machine forbids
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The referenced payment or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The wallet daemon could not be reached after exhausting retries
    #[error("Wallet daemon unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PaywallError {
    /// Whether the failure looks transient and is worth retrying.
    ///
    /// Only connectivity-class failures qualify; validation and business
    /// failures must never be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaywallError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for PaywallError {
    fn from(e: rusqlite::Error) -> Self {
        PaywallError::Database(e.to_string())
    }
}

/// Result type alias for paywall operations
pub type PaywallResult<T> = std::result::Result<T, PaywallError>;
