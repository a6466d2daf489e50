//! End-to-end tests for agentpay-node.
//!
//! Every test runs a complete node against the in-memory ledger, a static
//! catalog and a scripted analysis collaborator. Nothing leaves the process.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod harness;

mod gateway_tests;
mod http_tests;

pub use harness::{sign, ScriptedAnalysis, TestHarness, PRICE};
