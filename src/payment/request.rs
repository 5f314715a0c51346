//! Payment request records and reference tokens.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters used for generated tokens (no 0/O, 1/I/L lookalikes).
const TOKEN_ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Length of generated tokens.
pub const TOKEN_LEN: usize = 8;

/// Accepted token lengths when reading memos.
const TOKEN_MIN_LEN: usize = 4;
const TOKEN_MAX_LEN: usize = 32;

/// Opaque identity of the user asking for access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short token a user puts in their transfer memo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceToken(String);

impl ReferenceToken {
    /// Generate a random token.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let token = (0..TOKEN_LEN)
            .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
            .collect();
        Self(token)
    }

    /// Extract a token from a transfer memo.
    ///
    /// Surrounding whitespace and quotes and an optional `ref:` prefix are
    /// ignored, and case is folded. Returns `None` unless what remains is
    /// 4 to 32 ASCII alphanumerics.
    #[must_use]
    pub fn from_memo(memo: &str) -> Option<Self> {
        let mut s = memo.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if let Some(rest) = s
            .get(..4)
            .filter(|prefix| prefix.eq_ignore_ascii_case("ref:"))
            .and_then(|_| s.get(4..))
        {
            s = rest.trim_start();
        }
        if !(TOKEN_MIN_LEN..=TOKEN_MAX_LEN).contains(&s.len())
            || !s.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return None;
        }
        Some(Self(s.to_ascii_uppercase()))
    }

    /// The token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a payment request.
///
/// ```text
/// Pending ──match──▶ Matched ──grant──▶ Granted
///    │
///    └──timeout──▶ Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting for a transfer.
    Pending,
    /// A transfer was matched; access not yet granted.
    Matched,
    /// Access granted.
    Granted,
    /// No transfer arrived in time.
    Expired,
}

impl RequestStatus {
    /// Returns true if `self -> next` is an edge of the lifecycle.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Matched | Self::Expired) | (Self::Matched, Self::Granted)
        )
    }

    /// Returns true once no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Granted | Self::Expired)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::Granted => "granted",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A user's request for access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Requesting user.
    pub user_id: UserId,
    /// Token expected in the transfer memo.
    pub reference_token: ReferenceToken,
    /// Minimum amount in lamports.
    pub expected_amount: u64,
    /// Current status.
    pub status: RequestStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
    /// Transfer that satisfied the request.
    pub matched_tx_signature: Option<String>,
}
