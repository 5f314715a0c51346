//! Matches candidate transfers to pending requests.

use crate::error::Result;
use crate::ledger::dedup::{ConsumeReason, DedupLedger};
use crate::ledger::CandidateTransfer;
use crate::payment::request::{PaymentRequest, ReferenceToken, RequestStatus};
use crate::payment::store::{RequestStore, TransitionFields};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of matching one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The transfer settled this request (now Matched).
    Matched(PaymentRequest),
    /// The memo holds no reference token.
    NoReference,
    /// No active request holds the token.
    UnknownReference,
    /// The transfer was seen before, or the request was already settled.
    AlreadyConsumed,
    /// The transfer paid less than the request expects.
    AmountMismatch,
    /// The transfer landed after the request's deadline; the request is now
    /// Expired.
    Late(PaymentRequest),
}

/// Pairs transfers with requests, consuming each signature exactly once.
pub struct Matcher {
    store: Arc<RequestStore>,
    dedup: Arc<DedupLedger>,
    request_expiry: Option<chrono::Duration>,
}

impl Matcher {
    /// Create a matcher.
    #[must_use]
    pub fn new(store: Arc<RequestStore>, dedup: Arc<DedupLedger>) -> Self {
        Self {
            store,
            dedup,
            request_expiry: None,
        }
    }

    /// Refuse transfers whose block time is more than `expiry` after the
    /// request was created. Transfers without a block time are never late.
    #[must_use]
    pub fn with_request_expiry(mut self, expiry: Duration) -> Self {
        self.request_expiry = chrono::Duration::from_std(expiry).ok();
        self
    }

    fn is_late(&self, request: &PaymentRequest, transfer: &CandidateTransfer) -> bool {
        match (self.request_expiry, transfer.block_time) {
            (Some(expiry), Some(landed)) => landed > request.created_at + expiry,
            _ => false,
        }
    }

    /// Classify `transfer` and record its signature as consumed.
    ///
    /// Only the call that wins the Pending -> Matched transition returns
    /// [`MatchOutcome::Matched`]. The signature is consumed after the
    /// transition, so a crash in between re-delivers the transfer and the
    /// retry finds the request already Matched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the dedup ledger cannot be written.
    pub fn match_transfer(&self, transfer: &CandidateTransfer) -> Result<MatchOutcome> {
        let signature = transfer.signature.as_str();
        if self.dedup.contains(signature) {
            debug!("Transfer {signature} already consumed");
            return Ok(MatchOutcome::AlreadyConsumed);
        }

        let Some(token) = transfer.memo.as_deref().and_then(ReferenceToken::from_memo) else {
            info!(
                "Transfer {signature} from {} carries no reference token (memo {:?})",
                transfer.sender, transfer.memo
            );
            self.dedup.consume(signature, ConsumeReason::NoReference)?;
            return Ok(MatchOutcome::NoReference);
        };

        let Some(request) = self.store.get_by_token(&token) else {
            warn!("Transfer {signature} references unknown or expired token {token}");
            self.dedup.consume(signature, ConsumeReason::UnknownReference)?;
            return Ok(MatchOutcome::UnknownReference);
        };

        if transfer.amount < request.expected_amount {
            warn!(
                "Transfer {signature} for {token} paid {} lamports, expected {}",
                transfer.amount, request.expected_amount
            );
            self.dedup.consume(signature, ConsumeReason::AmountMismatch)?;
            return Ok(MatchOutcome::AmountMismatch);
        }

        if request.status == RequestStatus::Pending && self.is_late(&request, transfer) {
            let expired = self.store.transition(
                &token,
                RequestStatus::Pending,
                RequestStatus::Expired,
                TransitionFields::default(),
            )?;
            if expired {
                warn!(
                    "Transfer {signature} for {token} landed at {:?}, after the request's deadline",
                    transfer.block_time
                );
                self.dedup.consume(signature, ConsumeReason::Late)?;
                return Ok(MatchOutcome::Late(PaymentRequest {
                    status: RequestStatus::Expired,
                    ..request
                }));
            }
        }

        let won = self.store.transition(
            &token,
            RequestStatus::Pending,
            RequestStatus::Matched,
            TransitionFields {
                matched_tx_signature: Some(signature.to_string()),
            },
        )?;

        if !won {
            debug!(
                "Transfer {signature} lost the match for {token} (status {})",
                request.status
            );
            self.dedup.consume(signature, ConsumeReason::AlreadySettled)?;
            return Ok(MatchOutcome::AlreadyConsumed);
        }

        self.dedup.consume(signature, ConsumeReason::Matched)?;
        let matched = self.store.get_by_token(&token).unwrap_or_else(|| PaymentRequest {
            status: RequestStatus::Matched,
            matched_tx_signature: Some(signature.to_string()),
            ..request
        });
        info!(
            "Transfer {signature} matched request {token} for user {}",
            matched.user_id
        );
        Ok(MatchOutcome::Matched(matched))
    }
}
