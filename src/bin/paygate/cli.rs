//! Command-line interface definition.

use clap::{Parser, Subcommand};
use paygate::GateConfig;
use std::path::PathBuf;

/// Pay-to-join gatekeeper for a private Telegram channel.
#[derive(Parser, Debug)]
#[command(name = "paygate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short, global = true, env = "PAYGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root directory for state files.
    #[arg(long, global = true, env = "PAYGATE_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Ledger JSON-RPC endpoint.
    #[arg(long, global = true, env = "PAYGATE_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Address receiving payments.
    #[arg(long, global = true, env = "PAYGATE_PAYMENT_ADDRESS")]
    pub payment_address: Option<String>,

    /// Price of access in SOL.
    #[arg(long, global = true, env = "PAYGATE_PRICE")]
    pub price: Option<String>,

    /// Telegram bot token.
    #[arg(long, global = true, env = "PAYGATE_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// Gated channel id.
    #[arg(long, global = true, env = "PAYGATE_CHANNEL_ID", allow_hyphen_values = true)]
    pub channel_id: Option<i64>,

    /// Log level.
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true, env = "PAYGATE_LOG_JSON")]
    pub log_json: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scan on a timer until interrupted.
    Run,
    /// Run a single scan cycle and exit.
    ScanOnce,
    /// Open (or show) a payment request for a user.
    Request {
        /// User id.
        #[arg(allow_hyphen_values = true)]
        user: i64,
    },
    /// Show the status of a user's latest request.
    Status {
        /// User id.
        #[arg(allow_hyphen_values = true)]
        user: i64,
    },
}

impl Cli {
    /// Build the configuration: file first, then CLI and environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn to_config(&self) -> color_eyre::Result<GateConfig> {
        let mut config = if let Some(ref path) = self.config {
            GateConfig::from_file(path)?
        } else {
            GateConfig::default()
        };

        if let Some(ref root_dir) = self.root_dir {
            config.root_dir.clone_from(root_dir);
        }
        if let Some(ref rpc_url) = self.rpc_url {
            config.ledger.rpc_url.clone_from(rpc_url);
        }
        if let Some(ref address) = self.payment_address {
            config.ledger.payment_address.clone_from(address);
        }
        if let Some(ref price) = self.price {
            config.payment.price.clone_from(price);
        }
        if self.bot_token.is_some() {
            config.telegram.bot_token.clone_from(&self.bot_token);
        }
        if self.channel_id.is_some() {
            config.telegram.channel_id = self.channel_id;
        }
        config.log_level.clone_from(&self.log_level);

        Ok(config)
    }
}
