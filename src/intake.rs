//! Request intake: the `/start` and `/status` commands.
//!
//! Transport-agnostic. A chat front end passes the sender's id and message
//! text and delivers the returned reply however it likes.

use crate::error::Result;
use crate::event::{GateEvent, GateEventsSender};
use crate::payment::amount::format_sol;
use crate::payment::{PaymentRequest, RequestStatus, RequestStore, UserId};
use std::sync::Arc;
use tracing::debug;

/// A chat command understood by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask for access and get payment instructions.
    Start,
    /// Report the state of the caller's request.
    Status,
    /// Anything else.
    Unknown,
}

impl Command {
    /// Parse the first word of a message, ignoring a `@botname` suffix.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let word = text.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default();
        match name.to_ascii_lowercase().as_str() {
            "/start" => Self::Start,
            "/status" => Self::Status,
            _ => Self::Unknown,
        }
    }
}

/// Creates requests and renders replies for chat commands.
pub struct RequestIntake {
    store: Arc<RequestStore>,
    payment_address: String,
    price: u64,
    events: Option<GateEventsSender>,
}

impl RequestIntake {
    /// Create an intake for `payment_address` charging `price` lamports.
    #[must_use]
    pub fn new(store: Arc<RequestStore>, payment_address: String, price: u64) -> Self {
        Self {
            store,
            payment_address,
            price,
            events: None,
        }
    }

    /// Publish [`GateEvent::RequestCreated`] on `events`.
    #[must_use]
    pub fn with_events(mut self, events: GateEventsSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Backing request store.
    #[must_use]
    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    /// Return the user's open request, creating one if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if a new request cannot be persisted.
    pub fn open_request(&self, user_id: UserId) -> Result<PaymentRequest> {
        let (request, created) = self.store.find_or_create(user_id, self.price)?;
        if !created {
            debug!("User {user_id} reuses request {}", request.reference_token);
            return Ok(request);
        }
        if let Some(events) = &self.events {
            let _ = events.send(GateEvent::RequestCreated {
                user_id,
                token: request.reference_token.clone(),
            });
        }
        Ok(request)
    }

    /// Handle one chat message and return the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if a new request cannot be persisted.
    pub fn handle(&self, user_id: UserId, display_name: &str, text: &str) -> Result<String> {
        match Command::parse(text) {
            Command::Start => {
                if self
                    .store
                    .latest_for_user(user_id)
                    .is_some_and(|r| r.status == RequestStatus::Granted)
                {
                    return Ok("✅ You already have access to the private channel.".to_string());
                }
                let request = self.open_request(user_id)?;
                Ok(format!(
                    "👋 Hello, {display_name}!\n\n{}",
                    self.instructions(&request)
                ))
            }
            Command::Status => Ok(self.status(user_id)),
            Command::Unknown => Ok(
                "Send /start to get payment instructions, or /status to check your payment."
                    .to_string(),
            ),
        }
    }

    /// Payment instructions for `request`.
    #[must_use]
    pub fn instructions(&self, request: &PaymentRequest) -> String {
        if request.status == RequestStatus::Matched {
            return "💸 Your payment has been received. Access is being granted.".to_string();
        }
        format!(
            "Access to the private channel costs a one-time payment of {} SOL.\n\n\
             💰 Send it to: {}\n\
             📝 Put this reference in the transfer memo: {}\n\n\
             Payments without the reference cannot be matched to you. \
             Use /status to follow your request.",
            format_sol(request.expected_amount),
            self.payment_address,
            request.reference_token
        )
    }

    /// Status report for the user's latest request.
    #[must_use]
    pub fn status(&self, user_id: UserId) -> String {
        let Some(request) = self.store.latest_for_user(user_id) else {
            return "You have no payment request yet. Send /start to begin.".to_string();
        };
        match request.status {
            RequestStatus::Pending => format!(
                "⏳ Waiting for {} SOL to {} with memo {}.",
                format_sol(request.expected_amount),
                self.payment_address,
                request.reference_token
            ),
            RequestStatus::Matched => format!(
                "💸 Payment received in transaction {}. Access is being granted.",
                request.matched_tx_signature.as_deref().unwrap_or("?")
            ),
            RequestStatus::Granted => "✅ Access granted.".to_string(),
            RequestStatus::Expired => {
                "⌛ Your request expired before a payment arrived. Send /start for a new reference."
                    .to_string()
            }
        }
    }
}
