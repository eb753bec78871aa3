//! Configuration management for ln-paywall
//!
//! Configuration is loaded from TOML files and environment variables.
//!
//! # Example Configuration File
//!
//! ```toml
//! [wallet]
//! base_url = "http://127.0.0.1:9740"
//! api_key = "secret"
//!
//! [paywall]
//! max_amount_sat = 1000000
//! max_description_length = 256
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//! public_url = "https://pay.example.com"
//! webhook_secret = "shared-hmac-secret"
//!
//! [lnurl]
//! address_name = "paywall"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Wallet daemon connection configuration
    #[serde(default)]
    pub wallet: WalletConfig,

    /// Paywall behaviour configuration
    #[serde(default)]
    pub paywall: PaywallConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// LNURL-pay configuration
    #[serde(default)]
    pub lnurl: LnurlConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Wallet daemon connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Base URL of the wallet daemon's REST API
    #[serde(default = "default_wallet_base_url")]
    pub base_url: String,

    /// API key sent as a bearer token (if the daemon requires one)
    pub api_key: Option<String>,

    /// Timeout for individual payment-preparation calls, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Timeout for the initial connection probe, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Retry attempts for individual payment-preparation calls
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,

    /// Retry attempts for the initial connection.
    ///
    /// Connection loss is rarer and costlier than a single request hiccup,
    /// so the connect path tolerates more attempts.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Base backoff delay between retries, in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            base_url: default_wallet_base_url(),
            api_key: None,
            request_timeout_seconds: default_request_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            request_retries: default_request_retries(),
            connect_retries: default_connect_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_wallet_base_url() -> String {
    "http://127.0.0.1:9740".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_retries() -> u32 {
    3
}

fn default_connect_retries() -> u32 {
    6
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

/// Paywall behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaywallConfig {
    /// Minimum invoice amount (satoshis)
    #[serde(default = "default_min_amount")]
    pub min_amount_sat: u64,

    /// Maximum invoice amount (satoshis)
    #[serde(default = "default_max_amount")]
    pub max_amount_sat: u64,

    /// Maximum invoice description length (characters)
    #[serde(default = "default_max_description_length")]
    pub max_description_length: usize,

    /// Invoice expiry (seconds)
    #[serde(default = "default_invoice_expiry")]
    pub invoice_expiry_seconds: u32,

    /// Settlement event dedup window (seconds)
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_seconds: u64,

    /// Realtime stream heartbeat interval (seconds)
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u64,
}

impl Default for PaywallConfig {
    fn default() -> Self {
        Self {
            min_amount_sat: default_min_amount(),
            max_amount_sat: default_max_amount(),
            max_description_length: default_max_description_length(),
            invoice_expiry_seconds: default_invoice_expiry(),
            dedup_ttl_seconds: default_dedup_ttl(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl PaywallConfig {
    /// Dedup window as a `Duration`
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_seconds)
    }

    /// Heartbeat interval as a `Duration`
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }
}

fn default_min_amount() -> u64 {
    1
}

fn default_max_amount() -> u64 {
    1_000_000 // 0.01 BTC
}

fn default_max_description_length() -> usize {
    256
}

fn default_invoice_expiry() -> u32 {
    3600
}

fn default_dedup_ttl() -> u64 {
    300 // 5 minutes
}

fn default_heartbeat() -> u64 {
    15
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Publicly reachable base URL of this service.
    ///
    /// Used to build the webhook callback URL registered with the wallet
    /// daemon and the LNURL-pay callback. Must be HTTPS for webhook
    /// registration to be attempted.
    pub public_url: Option<String>,

    /// Shared secret for webhook HMAC signature verification.
    ///
    /// When set, webhook deliveries without a valid signature are rejected.
    pub webhook_secret: Option<String>,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Invoice-creation rate limit (requests per minute per remote address)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            public_url: None,
            webhook_secret: None,
            enable_cors: true,
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_rate_limit() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

/// LNURL-pay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnurlConfig {
    /// Name part of the lightning address served under /.well-known/lnurlp/
    #[serde(default = "default_lnurl_name")]
    pub address_name: String,

    /// Minimum sendable amount (millisatoshis)
    #[serde(default = "default_min_sendable")]
    pub min_sendable_msat: u64,

    /// Maximum sendable amount (millisatoshis)
    #[serde(default = "default_max_sendable")]
    pub max_sendable_msat: u64,
}

impl Default for LnurlConfig {
    fn default() -> Self {
        Self {
            address_name: default_lnurl_name(),
            min_sendable_msat: default_min_sendable(),
            max_sendable_msat: default_max_sendable(),
        }
    }
}

fn default_lnurl_name() -> String {
    "paywall".to_string()
}

fn default_min_sendable() -> u64 {
    1_000 // 1 sat
}

fn default_max_sendable() -> u64 {
    1_000_000_000 // 0.01 BTC
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Data directory for relative database paths
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:ln-paywall.db".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ln-paywall"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Resolve the database URL, making it relative to data_dir if needed
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;

        if url.starts_with("sqlite:/") || url == "sqlite::memory:" {
            return url.clone();
        }

        let path = url.strip_prefix("sqlite:").unwrap_or(url);

        if std::path::Path::new(path).is_absolute() {
            return url.clone();
        }

        let db_path = self.database.data_dir.join(path);
        format!("sqlite:{}", db_path.display())
    }

    /// The webhook callback URL to register with the wallet daemon, if a
    /// public HTTPS URL is configured
    pub fn webhook_callback_url(&self) -> Option<String> {
        let base = self.api.public_url.as_ref()?;
        Some(format!("{}/v1/webhook/payment", base.trim_end_matches('/')))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.paywall.min_amount_sat == 0 {
            return Err("Minimum amount must be at least 1 satoshi".to_string());
        }

        if self.paywall.min_amount_sat >= self.paywall.max_amount_sat {
            return Err("Minimum amount must be less than maximum amount".to_string());
        }

        if self.paywall.max_description_length == 0 {
            return Err("Maximum description length cannot be 0".to_string());
        }

        if self.lnurl.min_sendable_msat >= self.lnurl.max_sendable_msat {
            return Err("LNURL minSendable must be less than maxSendable".to_string());
        }

        if self.wallet.base_url.is_empty() {
            return Err("Wallet daemon base URL cannot be empty".to_string());
        }

        if let Some(public_url) = &self.api.public_url {
            let parsed = url::Url::parse(public_url)
                .map_err(|e| format!("Invalid public_url: {}", e))?;
            if parsed.scheme() != "https" && parsed.scheme() != "http" {
                return Err(format!("Invalid public_url scheme: {}", parsed.scheme()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_amount_bounds() {
        let mut config = Config::default();
        config.paywall.min_amount_sat = 2_000_000;
        assert!(config.validate().is_err());

        config.paywall.min_amount_sat = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_public_url() {
        let mut config = Config::default();
        config.api.public_url = Some("not a url".to_string());
        assert!(config.validate().is_err());

        config.api.public_url = Some("https://pay.example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_webhook_callback_url() {
        let mut config = Config::default();
        assert!(config.webhook_callback_url().is_none());

        config.api.public_url = Some("https://pay.example.com/".to_string());
        assert_eq!(
            config.webhook_callback_url().unwrap(),
            "https://pay.example.com/v1/webhook/payment"
        );
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [wallet]
            base_url = "http://localhost:9740"

            [api]
            bind_address = "0.0.0.0:9000"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.bind_address, "0.0.0.0:9000");
        assert_eq!(config.paywall.max_amount_sat, 1_000_000);
    }
}
