//! paygate CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use color_eyre::eyre::eyre;
use paygate::payment::RequestStore;
use paygate::{CycleOutcome, GateBuilder, GateConfig, RequestIntake, UserId};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let json = cli.log_json.then(|| fmt::layer().json());
    let plain = (!cli.log_json).then(|| fmt::layer());

    tracing_subscriber::registry()
        .with(json)
        .with(plain)
        .with(filter)
        .init();

    info!("paygate v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.to_config()?;

    match cli.command {
        Command::Run => {
            let gate = GateBuilder::new(config).build().await?;
            gate.run().await?;
            info!("Goodbye!");
        }
        Command::ScanOnce => {
            let gate = GateBuilder::new(config).build().await?;
            match gate.run_once().await? {
                CycleOutcome::Completed(report) => {
                    if let Some(e) = report.transient_error {
                        return Err(eyre!("scan cycle incomplete: {e}"));
                    }
                    println!(
                        "examined {} transfers, granted {}, cursor {}",
                        report.examined,
                        report.granted,
                        report.cursor.as_deref().unwrap_or("unchanged")
                    );
                }
                CycleOutcome::Skipped => println!("another scan is in progress"),
            }
        }
        Command::Request { user } => {
            let intake = open_intake(&config)?;
            let request = intake.open_request(UserId(user))?;
            println!("{}", intake.instructions(&request));
        }
        Command::Status { user } => {
            let intake = open_intake(&config)?;
            println!("{}", intake.status(UserId(user)));
        }
    }

    Ok(())
}

/// Open the request store for intake without touching the ledger.
///
/// Runs beside a scanning daemon on the same root directory; the store
/// serializes writes between the two processes.
fn open_intake(config: &GateConfig) -> color_eyre::Result<RequestIntake> {
    config.validate_ledger()?;
    std::fs::create_dir_all(&config.root_dir)?;
    let store = RequestStore::open(config.root_dir.join(paygate::gate::REQUESTS_FILE))?;
    let intake = RequestIntake::new(
        Arc::new(store),
        config.ledger.payment_address.clone(),
        config.payment.price_lamports()?,
    );
    Ok(intake)
}
