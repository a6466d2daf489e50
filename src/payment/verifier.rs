//! Settlement verifier.
//!
//! The only source of truth for a payment is the `ProductPaid` event the
//! ledger contract emitted in a confirmed transaction. Whatever the caller
//! claims about the resource or the amount is ignored.

use crate::error::{Error, Result};
use crate::ledger::{wait_for_receipt, ConfirmationPolicy, IAgenticCommerce, SharedLedger};
use alloy::primitives::{Address, Log, TxHash, U256};
use alloy::sol_types::SolEvent;
use tracing::{debug, info, warn};

/// A decoded `ProductPaid` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentEvent {
    /// Paying agent.
    pub buyer: Address,
    /// Product id as emitted.
    pub resource_id: U256,
    /// Amount in base units.
    pub amount: U256,
}

/// Decode every `ProductPaid` event emitted by `ledger_contract` in `logs`.
///
/// Logs from other contracts, with other signatures, or that fail to decode
/// are skipped.
#[must_use]
pub fn payment_events(logs: &[Log], ledger_contract: Address) -> Vec<PaymentEvent> {
    logs.iter()
        .filter(|log| log.address == ledger_contract)
        .filter(|log| log.topics().first() == Some(&IAgenticCommerce::ProductPaid::SIGNATURE_HASH))
        .filter_map(|log| match IAgenticCommerce::ProductPaid::decode_log_data(&log.data) {
            Ok(event) => Some(PaymentEvent {
                buyer: event.buyer,
                resource_id: event.productId,
                amount: event.amount,
            }),
            Err(e) => {
                debug!("Skipping undecodable ProductPaid log: {e}");
                None
            }
        })
        .collect()
}

/// First event paying at least `min_amount` for `expected_resource_id`.
#[must_use]
pub fn find_settlement(
    events: &[PaymentEvent],
    expected_resource_id: u64,
    min_amount: U256,
) -> Option<PaymentEvent> {
    let expected = U256::from(expected_resource_id);
    events
        .iter()
        .find(|event| event.resource_id == expected && event.amount >= min_amount)
        .copied()
}

/// Verifies settlements by re-reading the ledger.
pub struct SettlementVerifier {
    ledger: SharedLedger,
    ledger_contract: Address,
    policy: ConfirmationPolicy,
}

impl SettlementVerifier {
    /// Create a verifier trusting events from the ledger's configured contract.
    #[must_use]
    pub fn new(ledger: SharedLedger, policy: ConfirmationPolicy) -> Self {
        let ledger_contract = ledger.addresses().ledger_contract;
        Self {
            ledger,
            ledger_contract,
            policy,
        }
    }

    /// Confirmation policy in use.
    #[must_use]
    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    /// Check that `tx` settled a payment of at least `min_amount` for `expected_resource_id`.
    ///
    /// Waits for the configured confirmations first. `Ok(false)` means the
    /// transaction is confirmed but paid for something else, or too little.
    ///
    /// # Errors
    ///
    /// * `TransactionNotFound` - unknown after the bounded wait
    /// * `TransactionReverted` - mined with a failed status
    /// * `TransientLedger` - RPC failure or not confirmed deep enough in time
    pub async fn verify(
        &self,
        tx: TxHash,
        expected_resource_id: u64,
        min_amount: U256,
    ) -> Result<bool> {
        self.verify_settlement(tx, expected_resource_id, min_amount)
            .await
            .map(|event| event.is_some())
    }

    /// Like [`verify`](Self::verify), but returns the accepted event so the
    /// caller can check who paid.
    ///
    /// # Errors
    ///
    /// Same as [`verify`](Self::verify).
    pub async fn verify_settlement(
        &self,
        tx: TxHash,
        expected_resource_id: u64,
        min_amount: U256,
    ) -> Result<Option<PaymentEvent>> {
        let receipt = wait_for_receipt(self.ledger.as_ref(), tx, &self.policy).await?;
        if !receipt.success {
            warn!("Settlement {tx} reverted on-chain");
            return Err(Error::TransactionReverted(tx));
        }

        let events = payment_events(&receipt.logs, self.ledger_contract);
        if events.len() > 1 {
            warn!("Settlement {tx} carries {} payment events", events.len());
        }

        match find_settlement(&events, expected_resource_id, min_amount) {
            Some(event) => {
                info!(
                    "Settlement {tx} verified: resource {} paid {} by {}",
                    event.resource_id, event.amount, event.buyer
                );
                Ok(Some(event))
            }
            None => {
                warn!(
                    "Settlement {tx} has no payment of >= {min_amount} for resource {expected_resource_id} ({} events)",
                    events.len()
                );
                Ok(None)
            }
        }
    }
}
