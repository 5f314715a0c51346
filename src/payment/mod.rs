//! Payment verification and access grants.
//!
//! # Architecture
//!
//! ```text
//! CandidateTransfer
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ Already consumed?   │──yes──▶ AlreadyConsumed
//! └─────────┬───────────┘
//!           │ no
//!           ▼
//!   Token in memo? ──no──▶ NoReference (consumed)
//!           │
//!   Active request? ──no──▶ UnknownReference (consumed)
//!           │
//!   amount ≥ expected? ──no──▶ AmountMismatch (consumed, stays Pending)
//!           │
//!   landed by deadline? ──no──▶ Late (consumed, request Expired)
//!           │
//!   Pending ─▶ Matched ──lost──▶ AlreadyConsumed (consumed)
//!           │ won
//!           ▼
//!   grant_member ──fail──▶ stays Matched, retried next cycle
//!           │ ok
//!           ▼
//!   Matched ─▶ Granted, user notified
//! ```

pub mod amount;
mod granter;
mod matcher;
mod request;
mod store;

pub use granter::{AccessGranter, GrantOutcome, MembershipGateway, Notifier, GRANTED_MESSAGE};
pub use matcher::{MatchOutcome, Matcher};
pub use request::{PaymentRequest, ReferenceToken, RequestStatus, UserId, TOKEN_LEN};
pub use store::{RequestStore, TransitionFields};
