//! In-memory ledger for end-to-end tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paygate::ledger::{LedgerClient, LedgerTransaction, SignatureEntry, Transfer};
use paygate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// First slot handed out by the ledger.
const GENESIS_SLOT: u64 = 1_000;

/// Ledger holding transactions to one payment address, in slot order.
///
/// Every call yields to the scheduler first, so concurrent cycles really
/// interleave.
pub struct MockLedger {
    address: String,
    txs: Mutex<Vec<LedgerTransaction>>,
    tip: AtomicU64,
    fetch_budget: AtomicUsize,
}

impl MockLedger {
    /// Create an empty ledger for `address`.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            txs: Mutex::new(Vec::new()),
            tip: AtomicU64::new(GENESIS_SLOT),
            fetch_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Land a transfer of `lamports` to the payment address in the next slot.
    pub fn pay(&self, signature: &str, memo: Option<&str>, lamports: u64) {
        let slot = self.tip.fetch_add(1, Ordering::SeqCst) + 1;
        self.txs.lock().push(LedgerTransaction {
            signature: signature.to_string(),
            slot,
            block_time: Some(Utc::now()),
            failed: false,
            transfers: vec![Transfer {
                source: "payer".to_string(),
                destination: self.address.clone(),
                lamports,
            }],
            memo: memo.map(str::to_string),
        });
    }

    /// Produce `slots` empty slots.
    pub fn advance(&self, slots: u64) {
        self.tip.fetch_add(slots, Ordering::SeqCst);
    }

    /// Serve `count` more transactions, then fail every fetch.
    pub fn fail_after(&self, count: usize) {
        self.fetch_budget.store(count, Ordering::SeqCst);
    }

    /// Serve transactions again.
    pub fn recover(&self) {
        self.fetch_budget.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn signatures_since(
        &self,
        _address: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureEntry>> {
        tokio::task::yield_now().await;
        let txs = self.txs.lock();
        let start = cursor
            .and_then(|c| txs.iter().position(|t| t.signature == c))
            .map_or(0, |i| i + 1);
        Ok(txs[start..]
            .iter()
            .take(limit)
            .map(|t| SignatureEntry {
                signature: t.signature.clone(),
                slot: t.slot,
                failed: t.failed,
            })
            .collect())
    }

    async fn fetch_transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>> {
        tokio::task::yield_now().await;
        let budget = self.fetch_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(Error::Rpc("503 Service Unavailable".to_string()));
        }
        if budget != usize::MAX {
            self.fetch_budget.store(budget - 1, Ordering::SeqCst);
        }
        Ok(self
            .txs
            .lock()
            .iter()
            .find(|t| t.signature == signature)
            .cloned())
    }

    async fn tip_height(&self) -> Result<u64> {
        tokio::task::yield_now().await;
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_time(&self, _slot: u64) -> Result<Option<DateTime<Utc>>> {
        tokio::task::yield_now().await;
        Ok(Some(Utc::now()))
    }
}
