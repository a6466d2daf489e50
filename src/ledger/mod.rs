//! Ledger backends.
//!
//! Everything the node knows about the chain goes through the [`Ledger`]
//! trait. Two backends implement it:
//!
//! - [`EvmLedger`]: JSON-RPC against an EVM chain through `alloy`, with the
//!   operator key submitting signer-manager calls.
//! - [`MemoryLedger`]: an in-process chain with the same contract rules,
//!   used for local development and tests.
//!
//! Submitting methods only broadcast. Waiting for inclusion is done by
//! [`wait_for_receipt`], so every caller applies the same confirmation
//! policy.

mod contracts;
mod evm;
mod memory;

pub use contracts::{IAgentManager, IAgenticCommerce, IERC20};
pub use evm::EvmLedger;
pub use memory::{LedgerFault, MemoryLedger};

use crate::error::{Error, Result};
use alloy::primitives::{Address, Bytes, Log, TxHash, B256, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Addresses of the three contracts involved in a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractAddresses {
    /// Pay-per-access contract that emits `ProductPaid`.
    pub ledger_contract: Address,
    /// Payment token.
    pub token: Address,
    /// Signer manager that owns the agent wallets.
    pub signer_manager: Address,
}

impl ContractAddresses {
    /// Fixed addresses used by the in-memory ledger.
    #[must_use]
    pub fn local() -> Self {
        Self {
            ledger_contract: Address::repeat_byte(0x40),
            token: Address::repeat_byte(0x0c),
            signer_manager: Address::repeat_byte(0xa6),
        }
    }
}

/// The `payForProduct` call an agent makes against the ledger contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCall {
    /// Catalog id being paid for.
    pub resource_id: u64,
    /// Task label recorded on-chain.
    pub task: String,
    /// Per-attempt nonce.
    pub receipt_id: B256,
}

impl PaymentCall {
    /// ABI-encoded calldata for the ledger contract.
    #[must_use]
    pub fn calldata(&self) -> Bytes {
        IAgenticCommerce::payForProductCall {
            productId: U256::from(self.resource_id),
            task: self.task.clone(),
            receiptId: self.receipt_id,
        }
        .abi_encode()
        .into()
    }
}

/// A mined transaction as seen by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    /// Transaction hash.
    pub tx_hash: TxHash,
    /// False when the transaction reverted.
    pub success: bool,
    /// Block the transaction was included in.
    pub block_number: u64,
    /// Raw logs emitted by the transaction.
    pub logs: Vec<Log>,
}

/// Chain access used by the allowance client, executor and verifier.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Contract addresses this backend is bound to.
    fn addresses(&self) -> ContractAddresses;

    /// Agent wallet of `principal`, `None` when the manager returns the zero address.
    async fn signer_of(&self, principal: Address) -> Result<Option<Address>>;

    /// Broadcast the creation of an agent wallet for `principal`.
    async fn create_signer(&self, principal: Address, daily_limit: U256) -> Result<TxHash>;

    /// Token balance of `account` in base units.
    async fn token_balance(&self, account: Address) -> Result<U256>;

    /// Token approval granted by `owner` to `spender`.
    async fn token_allowance(&self, owner: Address, spender: Address) -> Result<U256>;

    /// What `signer` may still spend today.
    async fn remaining_daily_allowance(&self, signer: Address) -> Result<U256>;

    /// Broadcast a token approval executed by `signer`.
    async fn approve_from_signer(
        &self,
        signer: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxHash>;

    /// Broadcast `call` executed by `signer`, spending `amount`.
    async fn pay_from_signer(
        &self,
        signer: Address,
        call: &PaymentCall,
        amount: U256,
    ) -> Result<TxHash>;

    /// Receipt of `tx`, `None` while unknown or pending.
    async fn receipt(&self, tx: TxHash) -> Result<Option<LedgerReceipt>>;

    /// Current head block.
    async fn block_number(&self) -> Result<u64>;
}

/// Shared handle to a ledger backend.
pub type SharedLedger = Arc<dyn Ledger>;

/// How long and how deep to wait for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Required confirmations (the inclusion block counts as one).
    pub confirmations: u64,
    /// Upper bound on the whole wait.
    pub timeout: Duration,
    /// Delay between receipt polls.
    pub poll_interval: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            confirmations: 1,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Poll until `tx` is included with the required confirmations.
///
/// Reverted receipts are returned as-is; interpreting them is up to the
/// caller.
///
/// # Errors
///
/// * `TransactionNotFound` - the transaction never showed up before the deadline
/// * `TransientLedger` - it was seen but never reached the required depth, or RPC failed
pub async fn wait_for_receipt(
    ledger: &dyn Ledger,
    tx: TxHash,
    policy: &ConfirmationPolicy,
) -> Result<LedgerReceipt> {
    let deadline = Instant::now() + policy.timeout;
    let required = policy.confirmations.max(1);
    let mut seen = false;

    loop {
        if let Some(receipt) = ledger.receipt(tx).await? {
            seen = true;
            let head = ledger.block_number().await?;
            let depth = head.saturating_sub(receipt.block_number) + 1;
            if depth >= required {
                debug!("Transaction {tx} included at block {} ({depth} confirmations)", receipt.block_number);
                return Ok(receipt);
            }
        }

        if Instant::now() + policy.poll_interval > deadline {
            break;
        }
        tokio::time::sleep(policy.poll_interval).await;
    }

    if seen {
        warn!("Transaction {tx} did not reach {required} confirmations in {:?}", policy.timeout);
        Err(Error::TransientLedger(format!(
            "transaction {tx} not confirmed within {:?}",
            policy.timeout
        )))
    } else {
        warn!("Transaction {tx} unknown after {:?}", policy.timeout);
        Err(Error::TransactionNotFound(tx))
    }
}
