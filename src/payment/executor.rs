//! Settlement executor.
//!
//! Spends through a principal's delegated signer: approve if the current
//! token approval is short, then broadcast `payForProduct`. The executor
//! returns as soon as the payment is broadcast; confirming it is the
//! verifier's job.
//!
//! `pay` is not idempotent. A retry spends again, so callers must only retry
//! after the verifier shows no earlier attempt settled.

use crate::allowance::AllowanceClient;
use crate::error::{Error, Result};
use crate::ledger::{PaymentCall, SharedLedger};
use alloy::primitives::{Address, TxHash, B256, U256};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A broadcast payment, as the executor believes it was sent.
///
/// This is a local belief only. Access decisions use the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Transaction reference.
    pub tx_hash: TxHash,
    /// Resource the payment was for.
    pub resource_id: u64,
    /// Amount spent in base units.
    pub amount: U256,
    /// Per-attempt nonce sent with the call.
    pub receipt_id: B256,
    /// Paying delegated signer.
    pub signer: Address,
}

/// Per-principal async locks serialising authorize-then-spend.
#[derive(Default)]
struct PrincipalLocks {
    locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl PrincipalLocks {
    fn lock_for(&self, principal: Address) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        // Entries nobody holds or waits on can go.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(principal).or_default())
    }
}

/// Executes delegated payments.
pub struct SettlementExecutor {
    allowance: AllowanceClient,
    ledger: SharedLedger,
    approval_ceiling: U256,
    locks: PrincipalLocks,
}

impl SettlementExecutor {
    /// Create an executor.
    ///
    /// `approval_ceiling` is what gets approved to the ledger contract when
    /// the current approval cannot cover a payment.
    #[must_use]
    pub fn new(allowance: AllowanceClient, approval_ceiling: U256) -> Self {
        let ledger = Arc::clone(allowance.ledger());
        Self {
            allowance,
            ledger,
            approval_ceiling,
            locks: PrincipalLocks::default(),
        }
    }

    /// Allowance client used to find and authorize signers.
    #[must_use]
    pub fn allowance(&self) -> &AllowanceClient {
        &self.allowance
    }

    /// Pay `price` for `resource_id` from `principal`'s delegated signer.
    ///
    /// # Errors
    ///
    /// * `NoDelegatedSigner` - the principal has no signer
    /// * `PaymentRejected` - approval or payment refused by the ledger
    /// * `TransientLedger` - network failure; nothing is retried here
    pub async fn pay(
        &self,
        principal: Address,
        resource_id: u64,
        task: &str,
        price: U256,
    ) -> Result<SettlementRecord> {
        let lock = self.locks.lock_for(principal);
        let _guard = lock.lock().await;

        let signer = self
            .allowance
            .signer_for(principal)
            .await?
            .ok_or(Error::NoDelegatedSigner(principal))?;

        let spender = self.ledger.addresses().ledger_contract;
        if let Some(tx) = self
            .allowance
            .ensure_spend_authorized(signer, spender, price, self.approval_ceiling)
            .await
            .map_err(into_payment_error)?
        {
            info!("Signer {signer} re-authorized spend for {principal} in {tx}");
        }

        let call = PaymentCall {
            resource_id,
            task: task.to_string(),
            receipt_id: fresh_receipt_id(),
        };
        debug!(
            "Paying {price} for resource {resource_id} via {signer} (receipt {})",
            call.receipt_id
        );

        let tx_hash = self
            .ledger
            .pay_from_signer(signer, &call, price)
            .await
            .map_err(into_payment_error)?;

        info!("Payment for resource {resource_id} by {principal} broadcast as {tx_hash}");
        Ok(SettlementRecord {
            tx_hash,
            resource_id,
            amount: price,
            receipt_id: call.receipt_id,
            signer,
        })
    }
}

/// Fresh 32-byte receipt nonce.
fn fresh_receipt_id() -> B256 {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    B256::from(bytes)
}

fn into_payment_error(err: Error) -> Error {
    match err {
        Error::LedgerRejected(reason) => {
            warn!("Payment rejected by ledger: {reason}");
            Error::PaymentRejected(reason)
        }
        Error::TransactionReverted(tx) => Error::PaymentRejected(format!("approval {tx} reverted")),
        other => other,
    }
}
