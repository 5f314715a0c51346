//! Ledger access: read API, scanner and dedup bookkeeping.
//!
//! # Scan flow
//!
//! ```text
//!  cursor ──▶ signatures_since(address, cursor, page)   oldest-first
//!                     │
//!          ┌──────────┴───────────┐
//!       mature                 too shallow / not yet served
//!          │                          │
//!   fetch_transaction            end of batch
//!          │
//!   ┌──────┴──────┐
//! transfer     failed / no transfer to us
//!   │                 │
//! Matcher          skipped
//! ```
//!
//! The cursor is moved past a signature only once the matcher has consumed
//! it, so a crash mid-batch re-delivers transfers instead of losing them.

pub mod dedup;
pub mod scanner;
pub mod solana;

pub use dedup::{ConsumeReason, ConsumedEntry, DedupLedger};
pub use scanner::{LedgerScanner, ScanBatch, ScanItem, ScannerConfig, SkipReason};
pub use solana::{SolanaRpcClient, SolanaRpcConfig};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A signature touching the payment address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEntry {
    /// Transaction signature.
    pub signature: String,
    /// Slot the transaction landed in.
    pub slot: u64,
    /// Whether the transaction failed on chain.
    pub failed: bool,
}

/// A native transfer inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Paying account.
    pub source: String,
    /// Receiving account.
    pub destination: String,
    /// Amount in lamports.
    pub lamports: u64,
}

/// The parts of a transaction the gate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    /// Transaction signature.
    pub signature: String,
    /// Slot the transaction landed in.
    pub slot: u64,
    /// Block time, if the node reports one.
    pub block_time: Option<DateTime<Utc>>,
    /// Whether the transaction failed on chain.
    pub failed: bool,
    /// Native transfers, in instruction order.
    pub transfers: Vec<Transfer>,
    /// Memo text, if a memo instruction is present.
    pub memo: Option<String>,
}

/// A transfer to the payment address, ready for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTransfer {
    /// Transaction signature.
    pub signature: String,
    /// Paying account.
    pub sender: String,
    /// Always the payment address.
    pub recipient: String,
    /// Lamports received by the payment address.
    pub amount: u64,
    /// Memo text.
    pub memo: Option<String>,
    /// Slot the transaction landed in.
    pub block_height: u64,
    /// When the transaction landed, if the node reports it.
    pub block_time: Option<DateTime<Utc>>,
    /// When the scanner fetched it.
    pub observed_at: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Build a candidate from the transfers paying `address`.
    ///
    /// Returns `None` for failed transactions and for transactions that pay
    /// nothing to `address`.
    #[must_use]
    pub fn into_candidate(self, address: &str) -> Option<CandidateTransfer> {
        if self.failed {
            return None;
        }
        let mut incoming = self.transfers.iter().filter(|t| t.destination == address);
        let first = incoming.next()?;
        let amount = incoming.fold(first.lamports, |acc, t| acc.saturating_add(t.lamports));
        if amount == 0 {
            return None;
        }
        Some(CandidateTransfer {
            sender: first.source.clone(),
            recipient: address.to_string(),
            amount,
            memo: self.memo,
            block_height: self.slot,
            block_time: self.block_time,
            observed_at: Utc::now(),
            signature: self.signature,
        })
    }
}

/// Read-only ledger API.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Signatures touching `address` that are newer than `cursor`, oldest
    /// first, at most `limit` of them.
    async fn signatures_since(
        &self,
        address: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureEntry>>;

    /// Fetch one transaction; `None` if the node does not serve it yet.
    async fn fetch_transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>>;

    /// Current tip slot.
    async fn tip_height(&self) -> Result<u64>;

    /// Production time of `slot`; `None` if the slot was skipped or the node
    /// no longer knows it.
    async fn block_time(&self, slot: u64) -> Result<Option<DateTime<Utc>>>;
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn tx(transfers: Vec<Transfer>) -> LedgerTransaction {
        LedgerTransaction {
            signature: "S1".to_string(),
            slot: 10,
            block_time: None,
            failed: false,
            transfers,
            memo: Some("ABC123".to_string()),
        }
    }

    fn transfer(source: &str, destination: &str, lamports: u64) -> Transfer {
        Transfer {
            source: source.to_string(),
            destination: destination.to_string(),
            lamports,
        }
    }

    #[test]
    fn test_candidate_sums_transfers_to_address() {
        let landed = DateTime::<Utc>::from_timestamp(1_700_000_000, 0);
        let mut paid = tx(vec![
            transfer("alice", "gate", 4),
            transfer("alice", "bob", 100),
            transfer("carol", "gate", 6),
        ]);
        paid.block_time = landed;
        let candidate = paid.into_candidate("gate").expect("candidate");
        assert_eq!(candidate.amount, 10);
        assert_eq!(candidate.sender, "alice");
        assert_eq!(candidate.recipient, "gate");
        assert_eq!(candidate.block_height, 10);
        assert_eq!(candidate.block_time, landed);
        assert_eq!(candidate.memo.as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_no_candidate_without_incoming_transfer() {
        assert!(tx(vec![transfer("gate", "bob", 5)]).into_candidate("gate").is_none());
        assert!(tx(vec![]).into_candidate("gate").is_none());
        assert!(tx(vec![transfer("alice", "gate", 0)]).into_candidate("gate").is_none());
    }

    #[test]
    fn test_failed_transaction_is_not_a_candidate() {
        let mut failed = tx(vec![transfer("alice", "gate", 5)]);
        failed.failed = true;
        assert!(failed.into_candidate("gate").is_none());
    }
}
