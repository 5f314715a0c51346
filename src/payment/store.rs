//! Durable store of payment requests.
//!
//! The file on disk is the single source of truth for request status, and
//! more than one process may hold it open. Every mutation takes the store's
//! write lock, re-reads the file, applies the change, and persists it before
//! the change becomes visible. Reads are served from a cache that is
//! reloaded whenever the file has changed.

use crate::error::{Error, Result};
use crate::lock::WriteLock;
use crate::payment::request::{PaymentRequest, ReferenceToken, RequestStatus, UserId};
use crate::state::{Stamp, StateFile};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts at drawing an unused token before giving up.
const MAX_TOKEN_ATTEMPTS: usize = 32;

/// How long a mutation waits for another process holding the write lock.
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Extra fields written by a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Signature of the transfer that matched the request.
    pub matched_tx_signature: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RequestTable {
    next_id: u64,
    requests: BTreeMap<u64, PaymentRequest>,
}

impl RequestTable {
    /// The request holding `token` that is not Expired.
    fn active_mut(&mut self, token: &ReferenceToken) -> Option<&mut PaymentRequest> {
        self.requests
            .values_mut()
            .find(|r| r.status != RequestStatus::Expired && r.reference_token == *token)
    }
}

struct Inner {
    table: RequestTable,
    /// Token to id, for requests that are not Expired.
    active: HashMap<ReferenceToken, u64>,
    stamp: Option<Stamp>,
}

impl Inner {
    fn new(table: RequestTable, stamp: Option<Stamp>) -> Self {
        let active = index_active(&table);
        Self {
            table,
            active,
            stamp,
        }
    }
}

fn index_active(table: &RequestTable) -> HashMap<ReferenceToken, u64> {
    table
        .requests
        .iter()
        .filter(|(_, r)| r.status != RequestStatus::Expired)
        .map(|(id, r)| (r.reference_token.clone(), *id))
        .collect()
}

/// Durable request store with compare-and-transition updates.
pub struct RequestStore {
    file: StateFile,
    lock_path: PathBuf,
    inner: Mutex<Inner>,
}

impl RequestStore {
    /// Open (or create) the store at `path`.
    ///
    /// Mutations lock `path` with the extension `lock` beside it.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be decoded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = StateFile::new(path);
        let stamp = file.stamp();
        let table: RequestTable = file.load()?;
        debug!(
            "Loaded {} payment requests from {}",
            table.requests.len(),
            file.path().display()
        );
        Ok(Self {
            file,
            lock_path: path.with_extension("lock"),
            inner: Mutex::new(Inner::new(table, stamp)),
        })
    }

    /// Cached table, reloaded first if the file changed or `force` is set.
    fn read(&self, force: bool) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        let stamp = self.file.stamp();
        if force || stamp != inner.stamp {
            match self.file.load::<RequestTable>() {
                Ok(table) => *inner = Inner::new(table, stamp),
                Err(e) => warn!(
                    "Serving cached requests, reload of {} failed: {e}",
                    self.file.path().display()
                ),
            }
        }
        inner
    }

    /// Re-read the table under the write lock, apply `f`, and persist the
    /// result if `f` reports a change.
    fn write<T>(&self, f: impl FnOnce(&mut RequestTable) -> Result<(T, bool)>) -> Result<T> {
        let mut inner = self.inner.lock();
        let _lock = WriteLock::acquire(&self.lock_path, WRITE_LOCK_WAIT)?;

        let mut table: RequestTable = self.file.load()?;
        let (value, changed) = f(&mut table)?;
        if changed {
            self.file.save(&table)?;
        }
        *inner = Inner::new(table, self.file.stamp());
        Ok(value)
    }

    /// Create a Pending request with a fresh token.
    ///
    /// # Errors
    ///
    /// Returns an error if no unused token could be drawn or the write fails.
    pub fn create(&self, user_id: UserId, expected_amount: u64) -> Result<PaymentRequest> {
        let request = self.write(|table| Ok((insert_request(table, user_id, expected_amount)?, true)))?;
        info!(
            "Created payment request {} for user {} ({} lamports)",
            request.reference_token, user_id, expected_amount
        );
        Ok(request)
    }

    /// The user's Pending or Matched request, or a new Pending one.
    ///
    /// Returns the request and whether it was created. The lookup and the
    /// insert happen under one write lock, so concurrent callers for the
    /// same user end up with the same request.
    ///
    /// # Errors
    ///
    /// Returns an error if no unused token could be drawn or the write fails.
    pub fn find_or_create(
        &self,
        user_id: UserId,
        expected_amount: u64,
    ) -> Result<(PaymentRequest, bool)> {
        let (request, created) = self.write(|table| {
            if let Some(existing) = open_request_of(table, user_id) {
                return Ok(((existing.clone(), false), false));
            }
            Ok(((insert_request(table, user_id, expected_amount)?, true), true))
        })?;
        if created {
            info!(
                "Created payment request {} for user {} ({} lamports)",
                request.reference_token, user_id, expected_amount
            );
        }
        Ok((request, created))
    }

    /// Look up the active request holding `token`.
    ///
    /// A miss re-reads the file before giving up.
    #[must_use]
    pub fn get_by_token(&self, token: &ReferenceToken) -> Option<PaymentRequest> {
        let lookup = |inner: &Inner| {
            inner
                .active
                .get(token)
                .and_then(|id| inner.table.requests.get(id))
                .cloned()
        };
        let cached = lookup(&self.read(false));
        cached.or_else(|| lookup(&self.read(true)))
    }

    /// Move the active request holding `token` from `from` to `to`.
    ///
    /// Returns `Ok(false)` if there is no such request or its status is not
    /// `from`; the caller lost a race and must not act on the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if `from -> to` is not a
    /// lifecycle edge, or an error if the write fails.
    pub fn transition(
        &self,
        token: &ReferenceToken,
        from: RequestStatus,
        to: RequestStatus,
        fields: TransitionFields,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition(format!("{from} -> {to}")));
        }

        self.write(|table| {
            let Some(request) = table.active_mut(token) else {
                debug!("Transition {from} -> {to} for {token}: no active request");
                return Ok((false, false));
            };
            if request.status != from {
                debug!(
                    "Transition {from} -> {to} for {token} lost: status is {}",
                    request.status
                );
                return Ok((false, false));
            }

            request.status = to;
            request.updated_at = Utc::now();
            if let Some(signature) = fields.matched_tx_signature {
                request.matched_tx_signature = Some(signature);
            }
            Ok((true, true))
        })
    }

    /// Expire Pending requests older than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn expire_older_than(&self, max_age: Duration) -> Result<Vec<PaymentRequest>> {
        self.expire_created_before(Utc::now() - to_delta(max_age)?)
    }

    /// Expire Pending requests created at or before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn expire_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<PaymentRequest>> {
        let now = Utc::now();
        let expired = self.write(|table| {
            let mut expired = Vec::new();
            for request in table.requests.values_mut() {
                if request.status == RequestStatus::Pending && request.created_at <= cutoff {
                    request.status = RequestStatus::Expired;
                    request.updated_at = now;
                    expired.push(request.clone());
                }
            }
            let changed = !expired.is_empty();
            Ok((expired, changed))
        })?;
        if !expired.is_empty() {
            info!("Expired {} pending payment requests", expired.len());
        }
        Ok(expired)
    }

    /// Drop Expired requests whose last update is older than `retention`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn prune_expired_older_than(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now() - to_delta(retention)?;
        let pruned = self.write(|table| {
            let before = table.requests.len();
            table
                .requests
                .retain(|_, r| !(r.status == RequestStatus::Expired && r.updated_at <= cutoff));
            let pruned = before - table.requests.len();
            Ok((pruned, pruned > 0))
        })?;
        if pruned > 0 {
            debug!("Pruned {pruned} expired payment requests");
        }
        Ok(pruned)
    }

    /// The user's Pending or Matched request, if any.
    #[must_use]
    pub fn find_active_for_user(&self, user_id: UserId) -> Option<PaymentRequest> {
        open_request_of(&self.read(false).table, user_id).cloned()
    }

    /// The user's most recent request in any status.
    #[must_use]
    pub fn latest_for_user(&self, user_id: UserId) -> Option<PaymentRequest> {
        self.read(false)
            .table
            .requests
            .values()
            .rev()
            .find(|r| r.user_id == user_id)
            .cloned()
    }

    /// All requests with `status`, oldest first.
    #[must_use]
    pub fn with_status(&self, status: RequestStatus) -> Vec<PaymentRequest> {
        self.read(false)
            .table
            .requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Number of stored requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read(false).table.requests.len()
    }

    /// Returns true if no requests are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn open_request_of(table: &RequestTable, user_id: UserId) -> Option<&PaymentRequest> {
    table.requests.values().rev().find(|r| {
        r.user_id == user_id && matches!(r.status, RequestStatus::Pending | RequestStatus::Matched)
    })
}

fn insert_request(
    table: &mut RequestTable,
    user_id: UserId,
    expected_amount: u64,
) -> Result<PaymentRequest> {
    let active = index_active(table);
    let token = (0..MAX_TOKEN_ATTEMPTS)
        .map(|_| ReferenceToken::generate())
        .find(|t| !active.contains_key(t))
        .ok_or_else(|| Error::Storage("could not draw an unused reference token".to_string()))?;

    let now = Utc::now();
    let request = PaymentRequest {
        user_id,
        reference_token: token,
        expected_amount,
        status: RequestStatus::Pending,
        created_at: now,
        updated_at: now,
        matched_tx_signature: None,
    };
    let id = table.next_id;
    table.next_id += 1;
    table.requests.insert(id, request.clone());
    Ok(request)
}

fn to_delta(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Config(format!("duration out of range: {e}")))
}
