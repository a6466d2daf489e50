//! # agentpay-node
//!
//! A pay-per-access gateway for AI product analyses. A principal grants a
//! delegated signer (an "agent" wallet) a daily allowance; the node spends
//! through that signer against the ledger contract, re-reads the settlement
//! event from the chain, and only then forwards the request to the analysis
//! collaborator.
//!
//! ## Components
//!
//! - [`catalog`]: inverted word index resolving free text to product ids
//! - [`ledger`]: chain backends (EVM over JSON-RPC, in-memory simulation)
//! - [`allowance`]: delegated signer creation, balance and spend approval
//! - [`payment`]: settlement executor, verifier and replay guard
//! - [`analysis`]: downstream AI collaborator
//! - [`auth`]: principal signatures for requests acting on their behalf
//! - [`gateway`]: the per-request state machine tying it all together
//! - [`server`]: HTTP surface
//! - [`node`]: builder and runtime

pub mod allowance;
pub mod analysis;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod ledger;
pub mod node;
pub mod payment;
pub mod server;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use gateway::{
    AccessGateway, AccessGrant, AccessRequest, GatewayPolicy, GatewayState, PaymentProof, RejectReason,
    Rejection, ResourceTarget,
};
pub use node::{NodeBuilder, RunningNode};
