//! One scan cycle of the gate.
//!
//! A cycle retries grants left Matched by earlier cycles, drains one scan
//! batch through the matcher and granter, and commits the cursor. Only when
//! the batch has caught up with the confirmed ledger does it expire stale
//! requests, measured against the block time of the confirmation frontier,
//! so a transfer that landed in time is always seen before its request
//! expires. Old bookkeeping is pruned last. Cycles never overlap: a trigger
//! that fires while a cycle holds the run-lock is skipped.

use crate::error::{Error, Result};
use crate::event::{GateEvent, GateEventsSender};
use crate::ledger::{CandidateTransfer, DedupLedger, LedgerScanner, ScanBatch, ScanItem};
use crate::payment::{
    AccessGranter, GrantOutcome, MatchOutcome, Matcher, PaymentRequest, RequestStatus,
    RequestStore,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Timing knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pending requests expire once the confirmed ledger is this far past
    /// their creation.
    pub request_expiry: Duration,
    /// Consumed signatures and expired requests older than this are pruned.
    pub retention: Duration,
}

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Requests expired.
    pub expired: usize,
    /// Matched requests from earlier cycles re-sent to the granter.
    pub retried: usize,
    /// Scan items pulled.
    pub examined: usize,
    /// Signatures without a transfer to the payment address.
    pub skipped: usize,
    /// Transfers that matched a request.
    pub matched: usize,
    /// Transfers without a token.
    pub no_reference: usize,
    /// Transfers with an unknown token.
    pub unknown_reference: usize,
    /// Transfers below the price.
    pub amount_mismatch: usize,
    /// Transfers already consumed or arriving for a settled request.
    pub already_consumed: usize,
    /// Transfers that landed after their request's deadline.
    pub late: usize,
    /// Grants issued.
    pub granted: usize,
    /// Grants found already done.
    pub already_granted: usize,
    /// Grants that failed and stay Matched.
    pub grant_failures: usize,
    /// Consumed signatures pruned.
    pub pruned_signatures: usize,
    /// Expired requests pruned.
    pub pruned_requests: usize,
    /// Cursor after the cycle, if it moved.
    pub cursor: Option<String>,
    /// Transient failure that cut the scan short.
    pub transient_error: Option<String>,
}

/// Result of asking for a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle ran.
    Completed(CycleReport),
    /// Another cycle held the run-lock.
    Skipped,
}

/// Drives scan cycles over the store, scanner, matcher and granter.
pub struct GateEngine {
    store: Arc<RequestStore>,
    dedup: Arc<DedupLedger>,
    scanner: LedgerScanner,
    matcher: Matcher,
    granter: AccessGranter,
    config: EngineConfig,
    run_lock: Mutex<()>,
    events: Option<GateEventsSender>,
}

impl GateEngine {
    /// Create an engine. The matcher shares `store` and `dedup`.
    #[must_use]
    pub fn new(
        store: Arc<RequestStore>,
        dedup: Arc<DedupLedger>,
        scanner: LedgerScanner,
        granter: AccessGranter,
        config: EngineConfig,
    ) -> Self {
        let matcher = Matcher::new(Arc::clone(&store), Arc::clone(&dedup))
            .with_request_expiry(config.request_expiry);
        Self {
            store,
            dedup,
            scanner,
            matcher,
            granter,
            config,
            run_lock: Mutex::new(()),
            events: None,
        }
    }

    /// Publish cycle events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: GateEventsSender) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: GateEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Run one cycle unless another is in progress.
    ///
    /// Transient failures end the scan early and are recorded in the report.
    ///
    /// # Errors
    ///
    /// Returns fatal errors (storage, credentials) after emitting
    /// [`GateEvent::Fatal`].
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            debug!("Scan cycle already running, skipping trigger");
            return Ok(CycleOutcome::Skipped);
        };

        let mut report = CycleReport::default();
        match self.cycle(&mut report).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!("Scan cycle cut short: {e}");
                self.emit(GateEvent::ScanFailed {
                    message: e.to_string(),
                });
                report.transient_error = Some(e.to_string());
            }
            Err(e) => {
                error!("FATAL: payment processing halted: {e}");
                self.emit(GateEvent::Fatal {
                    message: e.to_string(),
                });
                return Err(e);
            }
        }

        info!(
            "Scan cycle done: examined={} matched={} granted={} failures={} rejected={} late={} expired={}",
            report.examined,
            report.matched,
            report.granted,
            report.grant_failures,
            report.no_reference + report.unknown_reference + report.amount_mismatch,
            report.late,
            report.expired
        );
        self.emit(GateEvent::CycleCompleted {
            examined: report.examined,
            granted: report.granted,
        });
        Ok(CycleOutcome::Completed(report))
    }

    async fn cycle(&self, report: &mut CycleReport) -> Result<()> {
        for request in self.store.with_status(RequestStatus::Matched) {
            report.retried += 1;
            self.settle(&request, report).await?;
        }

        self.scan(report).await?;

        report.pruned_signatures = self.dedup.prune_older_than(self.config.retention)?;
        report.pruned_requests = self.store.prune_expired_older_than(self.config.retention)?;
        Ok(())
    }

    async fn scan(&self, report: &mut CycleReport) -> Result<()> {
        let mut batch = self.scanner.scan().await?;
        let drained = self.drain(&mut batch, report).await;
        // Keep whatever was acknowledged, even if the batch stopped early.
        report.cursor = self.scanner.commit(&batch)?;
        drained?;
        self.expire(&batch, report).await
    }

    async fn expire(&self, batch: &ScanBatch, report: &mut CycleReport) -> Result<()> {
        let Some(frontier) = self.scanner.frontier(batch).await? else {
            debug!("Scan not caught up with the confirmed ledger, expiry deferred");
            return Ok(());
        };
        let expiry = chrono::Duration::from_std(self.config.request_expiry)
            .map_err(|e| Error::Config(format!("request expiry out of range: {e}")))?;
        let cutoff = frontier.min(Utc::now()) - expiry;
        for request in self.store.expire_created_before(cutoff)? {
            report.expired += 1;
            self.emit(GateEvent::RequestExpired {
                user_id: request.user_id,
                token: request.reference_token,
            });
        }
        Ok(())
    }

    async fn drain(&self, batch: &mut ScanBatch, report: &mut CycleReport) -> Result<()> {
        while let Some(item) = self.scanner.next_item(batch).await? {
            report.examined += 1;
            match item {
                ScanItem::Skipped { signature, reason } => {
                    debug!("Skipping {signature}: {reason:?}");
                    report.skipped += 1;
                }
                ScanItem::Transfer(transfer) => self.handle_transfer(&transfer, report).await?,
            }
            batch.acknowledge();
        }
        Ok(())
    }

    async fn handle_transfer(
        &self,
        transfer: &CandidateTransfer,
        report: &mut CycleReport,
    ) -> Result<()> {
        let outcome = self.matcher.match_transfer(transfer)?;
        let rejected = match &outcome {
            MatchOutcome::Matched(request) => {
                report.matched += 1;
                self.emit(GateEvent::TransferMatched {
                    signature: transfer.signature.clone(),
                    token: request.reference_token.clone(),
                });
                self.settle(request, report).await?;
                None
            }
            MatchOutcome::NoReference => {
                report.no_reference += 1;
                Some("no reference")
            }
            MatchOutcome::UnknownReference => {
                report.unknown_reference += 1;
                Some("unknown reference")
            }
            MatchOutcome::AmountMismatch => {
                report.amount_mismatch += 1;
                Some("amount mismatch")
            }
            MatchOutcome::AlreadyConsumed => {
                report.already_consumed += 1;
                None
            }
            MatchOutcome::Late(request) => {
                report.late += 1;
                self.emit(GateEvent::RequestExpired {
                    user_id: request.user_id,
                    token: request.reference_token.clone(),
                });
                Some("paid after the request expired")
            }
        };
        if let Some(reason) = rejected {
            self.emit(GateEvent::TransferRejected {
                signature: transfer.signature.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    async fn settle(&self, request: &PaymentRequest, report: &mut CycleReport) -> Result<()> {
        match self.granter.grant(request).await? {
            GrantOutcome::Granted => {
                report.granted += 1;
                self.emit(GateEvent::AccessGranted {
                    user_id: request.user_id,
                    token: request.reference_token.clone(),
                });
            }
            GrantOutcome::AlreadyGranted => report.already_granted += 1,
            GrantOutcome::ExternalFailure => {
                report.grant_failures += 1;
                self.emit(GateEvent::GrantFailed {
                    user_id: request.user_id,
                    token: request.reference_token.clone(),
                });
            }
        }
        Ok(())
    }
}
