//! # paygate
//!
//! Pay-to-join gatekeeper for a private Telegram channel.
//!
//! A user asks for access and receives a short reference token. They send
//! the price in SOL to the gate's address with the token in the transfer
//! memo. The gate polls the ledger, matches each confirmed transfer to its
//! request exactly once, and admits the user to the channel.
//!
//! ## Components
//!
//! - [`payment::RequestStore`]: durable pending-request table
//! - [`ledger::LedgerScanner`]: pull-based scan from a persisted cursor
//! - [`payment::Matcher`]: token and amount matching with a dedup ledger
//! - [`payment::AccessGranter`]: idempotent grants through a membership gateway
//! - [`engine::GateEngine`]: one non-overlapping scan cycle
//! - [`gate::RunningGate`]: the polling loop
//!
//! ## Example
//!
//! ```rust,ignore
//! use paygate::{GateBuilder, GateConfig};
//!
//! #[tokio::main]
//! async fn main() -> paygate::Result<()> {
//!     let config = GateConfig::from_file("paygate.toml".as_ref())?;
//!     let gate = GateBuilder::new(config).build().await?;
//!     gate.run().await
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod gate;
pub mod intake;
pub mod ledger;
pub mod lock;
pub mod payment;
pub mod state;
pub mod telegram;

pub use config::GateConfig;
pub use engine::{CycleOutcome, CycleReport, EngineConfig, GateEngine};
pub use error::{Error, Result};
pub use event::{create_event_channel, GateEvent, GateEventsChannel, GateEventsSender};
pub use gate::{GateBuilder, RunningGate};
pub use intake::{Command, RequestIntake};
pub use payment::{PaymentRequest, ReferenceToken, RequestStatus, UserId};
