//! Gate event system.

use crate::payment::{ReferenceToken, UserId};
use tokio::sync::broadcast;

/// Events emitted by the gate.
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// Gate has started.
    Started,

    /// Gate is shutting down.
    ShuttingDown,

    /// A user opened a payment request.
    RequestCreated {
        /// Requesting user.
        user_id: UserId,
        /// Token to put in the memo.
        token: ReferenceToken,
    },

    /// A transfer matched a request.
    TransferMatched {
        /// Transaction signature.
        signature: String,
        /// Matched request token.
        token: ReferenceToken,
    },

    /// A transfer was consumed without matching.
    TransferRejected {
        /// Transaction signature.
        signature: String,
        /// Outcome label.
        reason: String,
    },

    /// Access was granted.
    AccessGranted {
        /// User let in.
        user_id: UserId,
        /// Settled request token.
        token: ReferenceToken,
    },

    /// A grant failed and will be retried.
    GrantFailed {
        /// User waiting for access.
        user_id: UserId,
        /// Matched request token.
        token: ReferenceToken,
    },

    /// A pending request expired.
    RequestExpired {
        /// Requesting user.
        user_id: UserId,
        /// Released token.
        token: ReferenceToken,
    },

    /// A scan cycle finished.
    CycleCompleted {
        /// Transfers examined.
        examined: usize,
        /// Requests granted.
        granted: usize,
    },

    /// A scan cycle stopped on a transient failure.
    ScanFailed {
        /// Error message.
        message: String,
    },

    /// Payments cannot be processed.
    Fatal {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving gate events.
pub type GateEventsChannel = broadcast::Receiver<GateEvent>;

/// Sender for gate events.
pub type GateEventsSender = broadcast::Sender<GateEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (GateEventsSender, GateEventsChannel) {
    broadcast::channel(256)
}
