//! Grants channel access for matched requests.

use crate::error::{Error, Result};
use crate::payment::request::{PaymentRequest, RequestStatus, UserId};
use crate::payment::store::{RequestStore, TransitionFields};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Message sent to a user once access is granted.
pub const GRANTED_MESSAGE: &str =
    "✅ Payment verified! You now have access to the private channel.";

/// External channel-membership system.
#[async_trait]
pub trait MembershipGateway: Send + Sync {
    /// Give `user_id` access to the gated channel. Granting access to an
    /// existing member must succeed without side effects.
    async fn grant_member(&self, user_id: UserId) -> Result<()>;
}

/// Delivers messages to users.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `message` to `user_id`.
    async fn notify(&self, user_id: UserId, message: &str) -> Result<()>;
}

/// Result of a grant attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Access granted by this call.
    Granted,
    /// The request was already Granted; nothing was invoked.
    AlreadyGranted,
    /// The membership system failed; the request stays Matched.
    ExternalFailure,
}

/// Issues idempotent grants and settles requests.
pub struct AccessGranter {
    store: Arc<RequestStore>,
    membership: Arc<dyn MembershipGateway>,
    notifier: Arc<dyn Notifier>,
    call_timeout: Duration,
}

impl AccessGranter {
    /// Create a granter. `call_timeout` bounds each external call.
    #[must_use]
    pub fn new(
        store: Arc<RequestStore>,
        membership: Arc<dyn MembershipGateway>,
        notifier: Arc<dyn Notifier>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            membership,
            notifier,
            call_timeout,
        }
    }

    /// Grant access for `request`.
    ///
    /// The stored status is authoritative: a Granted request is never sent
    /// to the membership system again, and the request only becomes Granted
    /// through a successful Matched -> Granted transition.
    ///
    /// # Errors
    ///
    /// Returns fatal errors only: rejected credentials, or a failed write.
    /// Transient membership failures yield [`GrantOutcome::ExternalFailure`].
    pub async fn grant(&self, request: &PaymentRequest) -> Result<GrantOutcome> {
        let token = &request.reference_token;
        let current = self
            .store
            .get_by_token(token)
            .map_or(request.status, |r| r.status);

        match current {
            RequestStatus::Granted => {
                debug!("Request {token} already granted");
                return Ok(GrantOutcome::AlreadyGranted);
            }
            RequestStatus::Matched => {}
            other => {
                return Err(Error::InvalidTransition(format!(
                    "cannot grant request {token} in status {other}"
                )));
            }
        }

        let user_id = request.user_id;
        match tokio::time::timeout(self.call_timeout, self.membership.grant_member(user_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_transient() => {
                warn!("Granting access to user {user_id} for {token} failed: {e}");
                return Ok(GrantOutcome::ExternalFailure);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("Granting access to user {user_id} for {token} timed out");
                return Ok(GrantOutcome::ExternalFailure);
            }
        }

        let settled = self.store.transition(
            token,
            RequestStatus::Matched,
            RequestStatus::Granted,
            TransitionFields::default(),
        )?;
        if !settled {
            debug!("Request {token} was granted concurrently");
            return Ok(GrantOutcome::AlreadyGranted);
        }
        info!("Access granted to user {user_id} for request {token}");

        match tokio::time::timeout(self.call_timeout, self.notifier.notify(user_id, GRANTED_MESSAGE))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not notify user {user_id}: {e}"),
            Err(_) => warn!("Notifying user {user_id} timed out"),
        }

        Ok(GrantOutcome::Granted)
    }
}
