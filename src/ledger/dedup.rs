//! Scan cursor and consumed-signature ledger.
//!
//! Both records live in one state file so a cursor advance and the
//! signatures it covers are never persisted out of order.

use crate::error::{Error, Result};
use crate::state::StateFile;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Why a signature was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumeReason {
    /// Matched a pending request.
    Matched,
    /// No reference token in the memo.
    NoReference,
    /// Token did not belong to an active request.
    UnknownReference,
    /// Amount below the expected price.
    AmountMismatch,
    /// The request had already been settled by another transfer.
    AlreadySettled,
    /// Paid after the request's deadline.
    Late,
    /// The node kept failing to return the transaction.
    Unreadable,
}

/// A consumed signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumedEntry {
    /// Outcome recorded for the signature.
    pub reason: ConsumeReason,
    /// When it was consumed.
    pub consumed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DedupState {
    cursor: Option<String>,
    consumed: HashMap<String, ConsumedEntry>,
    #[serde(default)]
    failures: HashMap<String, u32>,
}

/// Durable scan cursor plus the set of consumed signatures.
pub struct DedupLedger {
    file: StateFile,
    state: Mutex<DedupState>,
}

impl DedupLedger {
    /// Open (or create) the ledger at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be decoded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = StateFile::new(path.as_ref());
        let state: DedupState = file.load()?;
        debug!(
            "Loaded dedup ledger: cursor={:?}, {} consumed signatures",
            state.cursor,
            state.consumed.len()
        );
        Ok(Self {
            file,
            state: Mutex::new(state),
        })
    }

    /// Last signature the scanner has moved past.
    #[must_use]
    pub fn cursor(&self) -> Option<String> {
        self.state.lock().cursor.clone()
    }

    /// Persist a new cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn advance_cursor(&self, signature: &str) -> Result<()> {
        self.update(|state| {
            state.cursor = Some(signature.to_string());
            true
        })
        .map(|_| ())
    }

    /// Returns true if `signature` was already consumed.
    #[must_use]
    pub fn contains(&self, signature: &str) -> bool {
        self.state.lock().consumed.contains_key(signature)
    }

    /// Look up a consumed signature.
    #[must_use]
    pub fn get(&self, signature: &str) -> Option<ConsumedEntry> {
        self.state.lock().consumed.get(signature).cloned()
    }

    /// Record `signature` as consumed.
    ///
    /// Returns `Ok(false)` without writing if it was already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn consume(&self, signature: &str, reason: ConsumeReason) -> Result<bool> {
        self.update(|state| {
            if state.consumed.contains_key(signature) {
                return false;
            }
            state.failures.remove(signature);
            state.consumed.insert(
                signature.to_string(),
                ConsumedEntry {
                    reason,
                    consumed_at: Utc::now(),
                },
            );
            true
        })
    }

    /// Count one more failed fetch of `signature` and return the total.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_failure(&self, signature: &str) -> Result<u32> {
        let mut count = 0;
        self.update(|state| {
            let entry = state.failures.entry(signature.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            count = *entry;
            true
        })?;
        Ok(count)
    }

    /// Failed fetches recorded for `signature`.
    #[must_use]
    pub fn failures(&self, signature: &str) -> u32 {
        self.state.lock().failures.get(signature).copied().unwrap_or(0)
    }

    /// Forget the failure count of `signature` after a successful fetch.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn clear_failures(&self, signature: &str) -> Result<()> {
        self.update(|state| state.failures.remove(signature).is_some())
            .map(|_| ())
    }

    /// Forget signatures consumed longer than `retention` ago.
    ///
    /// `retention` must exceed any re-org depth and the request expiry, or a
    /// re-delivered transfer could be classified a second time.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn prune_older_than(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;
        let mut pruned = 0;
        self.update(|state| {
            let before = state.consumed.len();
            state.consumed.retain(|_, e| e.consumed_at > cutoff);
            pruned = before - state.consumed.len();
            pruned > 0
        })?;
        if pruned > 0 {
            debug!("Pruned {pruned} consumed signatures");
        }
        Ok(pruned)
    }

    /// Number of consumed signatures.
    #[must_use]
    pub fn consumed_len(&self) -> usize {
        self.state.lock().consumed.len()
    }

    /// Apply `f` to a copy of the state and persist it if `f` returns true.
    fn update(&self, f: impl FnOnce(&mut DedupState) -> bool) -> Result<bool> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        if !f(&mut next) {
            return Ok(false);
        }
        self.file.save(&next)?;
        *guard = next;
        Ok(true)
    }
}
