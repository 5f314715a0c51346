//! End-to-end tests for paygate.
//!
//! The gate is assembled through [`paygate::GateBuilder`] over a temporary
//! state directory, an in-memory ledger and a recording membership gateway.

mod harness;
mod ledger;
mod scenarios;
