//! Gate assembly and the polling loop.

use crate::config::GateConfig;
use crate::engine::{CycleOutcome, EngineConfig, GateEngine};
use crate::error::Result;
use crate::event::{create_event_channel, GateEvent, GateEventsChannel, GateEventsSender};
use crate::intake::RequestIntake;
use crate::ledger::{
    DedupLedger, LedgerClient, LedgerScanner, ScannerConfig, SolanaRpcClient, SolanaRpcConfig,
};
use crate::lock::ProcessLock;
use crate::payment::{AccessGranter, MembershipGateway, Notifier, RequestStore};
use crate::telegram::TelegramGateway;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Request table file inside the root directory.
pub const REQUESTS_FILE: &str = "requests.state";

/// Cursor and consumed-signature file inside the root directory.
pub const DEDUP_FILE: &str = "dedup.state";

/// Builder for a payment gate.
pub struct GateBuilder {
    config: GateConfig,
    ledger: Option<Arc<dyn LedgerClient>>,
    membership: Option<(Arc<dyn MembershipGateway>, Arc<dyn Notifier>)>,
}

impl GateBuilder {
    /// Create a new gate builder with the given configuration.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            ledger: None,
            membership: None,
        }
    }

    /// Read the ledger through `ledger` instead of the configured RPC node.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Grant and notify through the given collaborators instead of Telegram.
    #[must_use]
    pub fn with_membership(
        mut self,
        membership: Arc<dyn MembershipGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        self.membership = Some((membership, notifier));
        self
    }

    /// Validate configuration, claim the root directory and open state.
    ///
    /// # Errors
    ///
    /// Returns a fatal error for invalid configuration, missing credentials,
    /// a held lock or unreadable state files.
    pub async fn build(self) -> Result<RunningGate> {
        info!("Building paygate with config: {:?}", self.config.ledger);

        self.config.validate_ledger()?;
        if self.membership.is_none() {
            self.config.validate_telegram()?;
        }

        std::fs::create_dir_all(&self.config.root_dir)?;
        let lock = ProcessLock::acquire(&self.config.root_dir)?;

        let store = Arc::new(RequestStore::open(self.config.root_dir.join(REQUESTS_FILE))?);
        let dedup = Arc::new(DedupLedger::open(self.config.root_dir.join(DEDUP_FILE))?);
        info!(
            "Loaded {} requests, {} consumed signatures, cursor {:?}",
            store.len(),
            dedup.consumed_len(),
            dedup.cursor()
        );

        let ledger: Arc<dyn LedgerClient> = match self.ledger {
            Some(ledger) => ledger,
            None => Arc::new(SolanaRpcClient::new(SolanaRpcConfig {
                rpc_url: self.config.ledger.rpc_url.clone(),
                request_timeout: self.config.ledger.request_timeout(),
                ..SolanaRpcConfig::default()
            })?),
        };

        let (membership, notifier) = match self.membership {
            Some(pair) => pair,
            None => {
                let telegram = Arc::new(TelegramGateway::new(&self.config.telegram)?);
                (
                    Arc::clone(&telegram) as Arc<dyn MembershipGateway>,
                    telegram as Arc<dyn Notifier>,
                )
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let scanner = LedgerScanner::new(
            ledger,
            Arc::clone(&dedup),
            ScannerConfig {
                payment_address: self.config.ledger.payment_address.clone(),
                min_confirmations: self.config.ledger.min_confirmations,
                page_size: self.config.ledger.page_size,
            },
        );
        let granter = AccessGranter::new(
            Arc::clone(&store),
            membership,
            notifier,
            self.config.telegram.request_timeout(),
        );
        let engine = GateEngine::new(
            Arc::clone(&store),
            dedup,
            scanner,
            granter,
            EngineConfig {
                request_expiry: self.config.payment.request_expiry(),
                retention: self.config.payment.consumed_retention(),
            },
        )
        .with_events(events_tx.clone());

        let intake = Arc::new(
            RequestIntake::new(
                store,
                self.config.ledger.payment_address.clone(),
                self.config.payment.price_lamports()?,
            )
            .with_events(events_tx.clone()),
        );

        Ok(RunningGate {
            config: self.config,
            _lock: lock,
            engine,
            intake,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// A built payment gate.
pub struct RunningGate {
    config: GateConfig,
    _lock: ProcessLock,
    engine: GateEngine,
    intake: Arc<RequestIntake>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: GateEventsSender,
    events_rx: Option<GateEventsChannel>,
}

impl RunningGate {
    /// Get the gate's root directory.
    #[must_use]
    pub fn root_dir(&self) -> &PathBuf {
        &self.config.root_dir
    }

    /// Request intake sharing this gate's store.
    ///
    /// The handle stays usable while [`RunningGate::run`] is scanning.
    #[must_use]
    pub fn intake(&self) -> Arc<RequestIntake> {
        Arc::clone(&self.intake)
    }

    /// Scan engine.
    #[must_use]
    pub fn engine(&self) -> &GateEngine {
        &self.engine
    }

    /// Get a receiver for gate events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<GateEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to gate events.
    #[must_use]
    pub fn subscribe_events(&self) -> GateEventsChannel {
        self.events_tx.subscribe()
    }

    /// Run a single scan cycle.
    ///
    /// # Errors
    ///
    /// Returns fatal errors from the cycle.
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        self.engine.run_cycle().await
    }

    /// Scan on the configured interval until shutdown is requested.
    ///
    /// A cycle in progress when shutdown arrives is abandoned at its next
    /// await point; everything it acknowledged is already durable.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error. Transient failures are retried on the
    /// next tick.
    pub async fn run(&self) -> Result<()> {
        let period = self.config.scan.poll_interval();
        info!(
            "Starting paygate on {} (every {}s)",
            self.config.ledger.payment_address,
            period.as_secs()
        );
        let _ = self.events_tx.send(GateEvent::Started);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break Ok(());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        outcome = self.engine.run_cycle() => match outcome {
                            Ok(CycleOutcome::Completed(report)) => {
                                debug!("Cycle report: {report:?}");
                            }
                            Ok(CycleOutcome::Skipped) => {}
                            Err(e) => break Err(e),
                        },
                        _ = shutdown_rx.changed() => {
                            info!("Shutdown requested during scan");
                            break Ok(());
                        }
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received Ctrl-C during scan, shutting down");
                            break Ok(());
                        }
                    }
                }
            }
        };

        let _ = self.events_tx.send(GateEvent::ShuttingDown);
        info!("Gate shutdown complete");
        result
    }

    /// Request the gate to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
