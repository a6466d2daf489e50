//! Error types for agentpay-node.

use alloy::primitives::{Address, TxHash};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the ledger, settlement, catalog and gateway layers.
#[derive(Debug, Error)]
pub enum Error {
    /// The principal has never created a delegated signer.
    #[error("Principal {0} has no delegated signer")]
    NoDelegatedSigner(Address),

    /// The ledger refused a state change (duplicate signer, bad limit, allowance or balance).
    #[error("Ledger rejected: {0}")]
    LedgerRejected(String),

    /// The payment transaction was refused before it could be broadcast.
    #[error("Payment rejected: {0}")]
    PaymentRejected(String),

    /// Network, RPC or timeout failure. Callers may retry; components never do.
    #[error("Transient ledger error: {0}")]
    TransientLedger(String),

    /// The transaction reference stayed unknown past the bounded wait.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TxHash),

    /// The transaction was mined but reverted.
    #[error("Transaction reverted: {0}")]
    TransactionReverted(TxHash),

    /// The transaction is confirmed but carries no matching payment event.
    #[error("Payment not verified for transaction {0}")]
    PaymentNotVerified(TxHash),

    /// The settlement already released a resource once.
    #[error("Settlement already consumed: {0}")]
    SettlementConsumed(TxHash),

    /// The request is not signed by the principal it acts for.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The settlement was paid by a signer the claimant does not own.
    #[error("Settlement {0} was not paid by the claimant")]
    PayerMismatch(TxHash),

    /// Free text could not be resolved and a direct id was required.
    #[error("Ambiguous resource: {0}")]
    AmbiguousResource(String),

    /// The resource id is not part of the catalog.
    #[error("Resource not found: {0}")]
    ResourceNotFound(u64),

    /// The downstream analysis collaborator failed.
    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    /// The request is missing or has malformed fields.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Catalog source failure.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server failure.
    #[error("Server error: {0}")]
    Server(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the caller may retry the whole operation.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientLedger(_))
    }
}
