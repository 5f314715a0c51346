//! Configuration for paygate.

use crate::error::{Error, Result};
use crate::payment::amount::parse_sol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Public mainnet RPC endpoint.
pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

/// Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Directory holding request, cursor and lock files.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Ledger configuration.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Pricing and retention.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Scan scheduling.
    #[serde(default)]
    pub scan: ScanConfig,

    /// Telegram configuration.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ledger RPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Base58 address receiving payments.
    #[serde(default)]
    pub payment_address: String,

    /// Slots that must follow a transfer before it is matched.
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u64,

    /// Maximum signatures handled per scan.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Pricing and retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Price of access in SOL, as a decimal string.
    #[serde(default = "default_price")]
    pub price: String,

    /// Hours a request may stay pending before it expires.
    #[serde(default = "default_request_expiry")]
    pub request_expiry_hours: u64,

    /// Hours consumed signatures and expired requests are retained.
    #[serde(default = "default_consumed_retention")]
    pub consumed_retention_hours: u64,
}

/// Scan scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Seconds between scan cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Telegram configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token.
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Gated channel or group id.
    #[serde(default)]
    pub channel_id: Option<i64>,

    /// Bot API base URL.
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            ledger: LedgerConfig::default(),
            payment: PaymentConfig::default(),
            scan: ScanConfig::default(),
            telegram: TelegramConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            payment_address: String::new(),
            min_confirmations: default_min_confirmations(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            price: default_price(),
            request_expiry_hours: default_request_expiry(),
            consumed_retention_hours: default_consumed_retention(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            channel_id: None,
            api_url: default_telegram_api_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "paygate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".paygate"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.to_string()
}

fn default_telegram_api_url() -> String {
    DEFAULT_TELEGRAM_API_URL.to_string()
}

fn default_price() -> String {
    "0.01".to_string()
}

const fn default_min_confirmations() -> u64 {
    32
}

const fn default_page_size() -> usize {
    100
}

const fn default_request_timeout() -> u64 {
    15
}

const fn default_request_expiry() -> u64 {
    24
}

const fn default_consumed_retention() -> u64 {
    24 * 7
}

const fn default_poll_interval() -> u64 {
    30
}

impl LedgerConfig {
    /// RPC request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TelegramConfig {
    /// Bot API request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PaymentConfig {
    /// Price in lamports.
    ///
    /// # Errors
    ///
    /// Returns an error if the price is not a valid SOL amount.
    pub fn price_lamports(&self) -> Result<u64> {
        parse_sol(&self.price)
    }

    /// How long a request may stay pending.
    #[must_use]
    pub fn request_expiry(&self) -> Duration {
        Duration::from_secs(self.request_expiry_hours * 3600)
    }

    /// How long consumed signatures are kept.
    #[must_use]
    pub fn consumed_retention(&self) -> Duration {
        Duration::from_secs(self.consumed_retention_hours * 3600)
    }
}

impl ScanConfig {
    /// Interval between scan cycles.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl GateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the settings required to scan and grant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] or [`Error::Credentials`]; both are fatal.
    pub fn validate(&self) -> Result<()> {
        self.validate_ledger()?;
        self.validate_telegram()
    }

    /// Check ledger, pricing and expiry settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed payment address, a zero
    /// page size, price or expiry.
    pub fn validate_ledger(&self) -> Result<()> {
        validate_address(&self.ledger.payment_address)?;

        if self.ledger.page_size == 0 {
            return Err(Error::Config("ledger.page_size must be positive".to_string()));
        }
        if self.payment.price_lamports()? == 0 {
            return Err(Error::Config("payment.price must be positive".to_string()));
        }
        if self.payment.request_expiry_hours == 0 {
            return Err(Error::Config(
                "payment.request_expiry_hours must be positive".to_string(),
            ));
        }
        if self.payment.consumed_retention_hours < self.payment.request_expiry_hours {
            return Err(Error::Config(
                "payment.consumed_retention_hours must not be shorter than request_expiry_hours"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Check Telegram credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credentials`] without a bot token and
    /// [`Error::Config`] without a channel id.
    pub fn validate_telegram(&self) -> Result<()> {
        match self.telegram.bot_token.as_deref() {
            Some(token) if !token.trim().is_empty() => {}
            _ => return Err(Error::Credentials("telegram.bot_token is not set".to_string())),
        }
        if self.telegram.channel_id.is_none() {
            return Err(Error::Config("telegram.channel_id is not set".to_string()));
        }

        Ok(())
    }
}

/// Validate a base58 ledger address (32-byte public key).
///
/// # Errors
///
/// Returns [`Error::Config`] if the address is empty or malformed.
pub fn validate_address(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(Error::Config("ledger.payment_address is not set".to_string()));
    }
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| Error::Config(format!("payment address {address} is not base58: {e}")))?;
    if bytes.len() != 32 {
        return Err(Error::Config(format!(
            "payment address {address} decodes to {} bytes, expected 32",
            bytes.len()
        )));
    }
    Ok(())
}
