//! Ledger scanner producing candidate transfers since the stored cursor.

use crate::error::Result;
use crate::ledger::dedup::{ConsumeReason, DedupLedger};
use crate::ledger::{CandidateTransfer, LedgerClient, LedgerTransaction, SignatureEntry};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Failed fetches of one signature, while the node is otherwise reachable,
/// after which it is consumed as unreadable.
pub const MAX_FETCH_FAILURES: u32 = 8;

/// Configuration for the ledger scanner.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Address receiving payments.
    pub payment_address: String,
    /// Slots that must follow a transaction before it is delivered.
    pub min_confirmations: u64,
    /// Maximum signatures per scan.
    pub page_size: usize,
}

/// Why a signature produced no candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The transaction failed on chain.
    Failed,
    /// Nothing in the transaction pays the payment address.
    NoIncomingTransfer,
    /// The node failed to return the transaction too many times.
    Unreadable,
}

/// One step of a scan batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// A transfer for the matcher.
    Transfer(CandidateTransfer),
    /// A signature with nothing to match.
    Skipped {
        /// Transaction signature.
        signature: String,
        /// Why it was skipped.
        reason: SkipReason,
    },
}

impl ScanItem {
    /// Signature of the underlying transaction.
    #[must_use]
    pub fn signature(&self) -> &str {
        match self {
            Self::Transfer(t) => &t.signature,
            Self::Skipped { signature, .. } => signature,
        }
    }
}

/// A finite, pull-based batch of signatures from one scan.
///
/// Transaction details are fetched only when the caller pulls the next item.
/// The caller acknowledges each item once it has been fully handled; only
/// acknowledged items move the cursor on [`LedgerScanner::commit`].
#[derive(Debug)]
pub struct ScanBatch {
    pending: VecDeque<SignatureEntry>,
    tip: u64,
    truncated: bool,
    reached_shallow: bool,
    blocked: bool,
    in_flight: Option<String>,
    handled: Option<String>,
    delivered: usize,
}

impl ScanBatch {
    /// Signatures not yet pulled.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Items pulled so far.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Tip slot observed when the batch was listed.
    #[must_use]
    pub fn tip(&self) -> u64 {
        self.tip
    }

    /// Mark the last pulled item as fully handled.
    pub fn acknowledge(&mut self) {
        if let Some(signature) = self.in_flight.take() {
            self.handled = Some(signature);
        }
    }

    /// Last acknowledged signature.
    #[must_use]
    pub fn handled(&self) -> Option<&str> {
        self.handled.as_deref()
    }

    /// Returns true once every confirmed signature up to the tip has been
    /// pulled.
    ///
    /// False while signatures remain, when the listing was cut at the page
    /// size, or when an unserved transaction ended the batch.
    #[must_use]
    pub fn caught_up(&self) -> bool {
        self.pending.is_empty() && !self.blocked && (!self.truncated || self.reached_shallow)
    }
}

/// Polls the ledger for transfers to the payment address.
pub struct LedgerScanner {
    ledger: Arc<dyn LedgerClient>,
    dedup: Arc<DedupLedger>,
    config: ScannerConfig,
}

impl LedgerScanner {
    /// Create a scanner over `ledger`, resuming from the cursor in `dedup`.
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerClient>, dedup: Arc<DedupLedger>, config: ScannerConfig) -> Self {
        Self {
            ledger,
            dedup,
            config,
        }
    }

    /// Payment address being scanned.
    #[must_use]
    pub fn payment_address(&self) -> &str {
        &self.config.payment_address
    }

    /// List signatures newer than the cursor.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the ledger cannot be reached. The cursor
    /// is not touched.
    pub async fn scan(&self) -> Result<ScanBatch> {
        let cursor = self.dedup.cursor();
        let entries = self
            .ledger
            .signatures_since(
                &self.config.payment_address,
                cursor.as_deref(),
                self.config.page_size,
            )
            .await?;
        let tip = self.ledger.tip_height().await?;

        debug!(
            "Scan from cursor {:?}: {} signatures, tip {}",
            cursor,
            entries.len(),
            tip
        );

        Ok(ScanBatch {
            truncated: entries.len() >= self.config.page_size,
            pending: entries.into_iter().take(self.config.page_size).collect(),
            tip,
            reached_shallow: false,
            blocked: false,
            in_flight: None,
            handled: None,
            delivered: 0,
        })
    }

    /// Block time of the confirmation frontier, once `batch` is caught up.
    ///
    /// Every transfer confirmed before the returned instant has been
    /// delivered. `None` if the batch is not caught up or the frontier slot
    /// has no block time.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the ledger cannot be reached.
    pub async fn frontier(&self, batch: &ScanBatch) -> Result<Option<DateTime<Utc>>> {
        if !batch.caught_up() {
            return Ok(None);
        }
        let slot = batch.tip.saturating_sub(self.config.min_confirmations);
        let time = self.ledger.block_time(slot).await?;
        debug!("Confirmation frontier at slot {slot}: {time:?}");
        Ok(time)
    }

    /// Pull the next item of `batch`.
    ///
    /// Returns `Ok(None)` when the batch is exhausted, when the next signature
    /// is not deep enough yet, or when the node cannot serve its transaction
    /// yet. In the last two cases the signature stays ahead of the cursor and
    /// is listed again by the next scan.
    ///
    /// A signature whose fetch fails [`MAX_FETCH_FAILURES`] times while the
    /// node still answers is consumed and returned as
    /// [`SkipReason::Unreadable`].
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction cannot be fetched.
    pub async fn next_item(&self, batch: &mut ScanBatch) -> Result<Option<ScanItem>> {
        let Some(entry) = batch.pending.front() else {
            return Ok(None);
        };

        let depth = batch.tip.saturating_sub(entry.slot);
        if depth < self.config.min_confirmations {
            debug!(
                "Signature {} has {} of {} confirmations, ending batch",
                entry.signature, depth, self.config.min_confirmations
            );
            batch.pending.clear();
            batch.reached_shallow = true;
            return Ok(None);
        }

        let item = if entry.failed {
            ScanItem::Skipped {
                signature: entry.signature.clone(),
                reason: SkipReason::Failed,
            }
        } else {
            let signature = entry.signature.clone();
            match self.fetch(&signature).await? {
                Fetched::Unreadable => ScanItem::Skipped {
                    signature,
                    reason: SkipReason::Unreadable,
                },
                Fetched::Transaction(None) => {
                    debug!("Transaction {signature} not served yet, ending batch");
                    batch.pending.clear();
                    batch.blocked = true;
                    return Ok(None);
                }
                Fetched::Transaction(Some(tx)) => {
                    if tx.failed {
                        ScanItem::Skipped {
                            signature,
                            reason: SkipReason::Failed,
                        }
                    } else {
                        match tx.into_candidate(&self.config.payment_address) {
                            Some(candidate) => ScanItem::Transfer(candidate),
                            None => ScanItem::Skipped {
                                signature,
                                reason: SkipReason::NoIncomingTransfer,
                            },
                        }
                    }
                }
            }
        };

        batch.pending.pop_front();
        batch.in_flight = Some(item.signature().to_string());
        batch.delivered += 1;
        Ok(Some(item))
    }

    /// Fetch `signature`, counting failures against it while the node is
    /// otherwise healthy.
    async fn fetch(&self, signature: &str) -> Result<Fetched> {
        let err = match self.ledger.fetch_transaction(signature).await {
            Ok(tx) => {
                if self.dedup.failures(signature) > 0 {
                    self.dedup.clear_failures(signature)?;
                }
                return Ok(Fetched::Transaction(tx));
            }
            Err(e) => e,
        };
        if !err.is_transient() {
            return Err(err);
        }
        // An unreachable node is an outage, not a bad signature.
        if let Err(tip_err) = self.ledger.tip_height().await {
            debug!("Node unreachable after fetch of {signature} failed: {tip_err}");
            return Err(err);
        }

        let failures = self.dedup.record_failure(signature)?;
        if failures < MAX_FETCH_FAILURES {
            warn!("Fetch of {signature} failed ({failures}/{MAX_FETCH_FAILURES}): {err}");
            return Err(err);
        }
        error!(
            "Giving up on transaction {signature} after {failures} failed fetches: {err}. \
             Any payment in it must be settled by hand"
        );
        self.dedup.consume(signature, ConsumeReason::Unreadable)?;
        Ok(Fetched::Unreadable)
    }

    /// Persist the cursor at the last acknowledged item of `batch`.
    ///
    /// Returns the new cursor, or `None` if nothing was acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn commit(&self, batch: &ScanBatch) -> Result<Option<String>> {
        let Some(signature) = batch.handled() else {
            return Ok(None);
        };
        self.dedup.advance_cursor(signature)?;
        info!("Scan cursor advanced to {}", signature);
        Ok(Some(signature.to_string()))
    }
}

enum Fetched {
    Transaction(Option<LedgerTransaction>),
    Unreadable,
}
