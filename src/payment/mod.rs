//! Settlement system for agentpay-node.
//!
//! This module implements the pay-then-verify protocol:
//! 1. Spend through the principal's delegated signer (approve if needed, then pay)
//! 2. Independently confirm the settlement event on the ledger
//! 3. Let each verified settlement release its resource only once
//!
//! # Architecture
//!
//! ```text
//! Access request
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ Settlement executor │  per-principal lock
//! └─────────┬───────────┘
//!           │ tx hash (broadcast, unconfirmed)
//!           ▼
//! ┌─────────────────────┐
//! │ Settlement verifier │  re-reads receipt + ProductPaid
//! └─────────┬───────────┘
//!           │
//!    ┌──────┴──────┐
//!    │             │
//!  MATCH       NO MATCH / REVERTED
//!    │             │
//!    ▼             ▼
//! Consume tx    Reject
//!    │
//!  FRESH ──► Release resource
//!  REPLAY ─► Reject
//! ```

mod cache;
mod executor;
mod verifier;

pub use cache::{ConsumedSettlements, ConsumptionStats};
pub use executor::{SettlementExecutor, SettlementRecord};
pub use verifier::{find_settlement, payment_events, PaymentEvent, SettlementVerifier};
