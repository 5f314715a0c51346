//! Error types for paygate.

use thiserror::Error;

/// Result type alias using paygate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in paygate.
///
/// Variants fall into three classes, see [`Error::is_transient`] and
/// [`Error::is_fatal`]. Conflicts and bad transfers are not errors: they
/// surface as `false` from a store transition or as a match outcome.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or rejected credentials.
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// Durable state could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Ledger RPC failure (unreachable, rate limited, malformed reply).
    #[error("Ledger RPC error: {0}")]
    Rpc(String),

    /// Membership system or messaging failure.
    #[error("Membership error: {0}")]
    Membership(String),

    /// An external call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Request store rejected a state change that is not a forward edge.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Another process holds the state directory.
    #[error("State directory is locked: {0}")]
    Locked(String),
}

impl Error {
    /// Returns true for failures that are retried on the next cycle.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Membership(_) | Self::Timeout(_))
    }

    /// Returns true for failures that make payment processing impossible.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Rpc(e.to_string())
        }
    }
}
