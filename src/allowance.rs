//! Allowance ledger client.
//!
//! Reads and writes delegated signer state: agent creation, balance,
//! remaining daily allowance and token spend approval. Every write waits for
//! inclusion before returning, so callers never act on a transaction the
//! chain has not accepted yet.

use crate::error::{Error, Result};
use crate::ledger::{wait_for_receipt, ConfirmationPolicy, SharedLedger};
use alloy::primitives::{Address, TxHash, U256};
use tracing::{debug, info, warn};

/// Snapshot of a principal's delegated signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerStatus {
    /// Agent wallet address.
    pub signer: Address,
    /// Token balance in base units.
    pub balance: U256,
    /// What the agent may still spend today.
    pub remaining_daily_allowance: U256,
}

/// Client for delegated signer state on the ledger.
#[derive(Clone)]
pub struct AllowanceClient {
    ledger: SharedLedger,
    policy: ConfirmationPolicy,
}

impl AllowanceClient {
    /// Create a client over `ledger` using `policy` for write confirmations.
    ///
    /// Signer creation and approvals wait for inclusion only, whatever depth
    /// `policy` asks of settlements.
    #[must_use]
    pub fn new(ledger: SharedLedger, policy: ConfirmationPolicy) -> Self {
        let policy = ConfirmationPolicy {
            confirmations: 1,
            ..policy
        };
        Self { ledger, policy }
    }

    /// The ledger this client writes to.
    #[must_use]
    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    /// Create a delegated signer for `principal` with `daily_limit` base units per day.
    ///
    /// # Errors
    ///
    /// * `LedgerRejected` - the principal already has a signer, the limit is zero,
    ///   or the creation transaction reverted
    /// * `TransientLedger` / `TransactionNotFound` - the chain did not confirm in time
    pub async fn create_delegated_signer(
        &self,
        principal: Address,
        daily_limit: U256,
    ) -> Result<Address> {
        if principal.is_zero() {
            return Err(Error::LedgerRejected("principal must not be the zero address".to_string()));
        }
        if daily_limit.is_zero() {
            return Err(Error::LedgerRejected("daily limit must be non-zero".to_string()));
        }
        if let Some(existing) = self.signer_for(principal).await? {
            return Err(Error::LedgerRejected(format!(
                "principal {principal} already has signer {existing}"
            )));
        }

        let tx = self.ledger.create_signer(principal, daily_limit).await?;
        let receipt = wait_for_receipt(self.ledger.as_ref(), tx, &self.policy).await?;
        if !receipt.success {
            warn!("Signer creation for {principal} reverted in {tx}");
            return Err(Error::LedgerRejected(format!("signer creation reverted in {tx}")));
        }

        let signer = self.signer_for(principal).await?.ok_or_else(|| {
            Error::LedgerRejected(format!("no signer recorded for {principal} after {tx}"))
        })?;
        info!("Created delegated signer {signer} for {principal} (daily limit {daily_limit})");
        Ok(signer)
    }

    /// Delegated signer of `principal`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger read fails.
    pub async fn signer_for(&self, principal: Address) -> Result<Option<Address>> {
        let signer = self.ledger.signer_of(principal).await?;
        Ok(signer.filter(|s| !s.is_zero()))
    }

    /// Token balance of `signer` in base units.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger read fails.
    pub async fn balance(&self, signer: Address) -> Result<U256> {
        self.ledger.token_balance(signer).await
    }

    /// Remaining daily allowance of `signer` in base units.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger read fails.
    pub async fn remaining_daily_allowance(&self, signer: Address) -> Result<U256> {
        self.ledger.remaining_daily_allowance(signer).await
    }

    /// Balance and allowance of `principal`'s signer, `None` without one.
    ///
    /// # Errors
    ///
    /// Returns an error if a ledger read fails.
    pub async fn signer_status(&self, principal: Address) -> Result<Option<SignerStatus>> {
        let Some(signer) = self.signer_for(principal).await? else {
            return Ok(None);
        };
        let (balance, remaining) = futures::try_join!(
            self.balance(signer),
            self.remaining_daily_allowance(signer)
        )?;
        Ok(Some(SignerStatus {
            signer,
            balance,
            remaining_daily_allowance: remaining,
        }))
    }

    /// Approve `spender` to pull `amount` from `signer` and wait for one confirmation.
    ///
    /// Re-approving the same or a higher amount is safe.
    ///
    /// # Errors
    ///
    /// * `LedgerRejected` - the approval was refused or reverted
    /// * `TransientLedger` / `TransactionNotFound` - the chain did not confirm in time
    pub async fn authorize_spend(
        &self,
        signer: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxHash> {
        let tx = self
            .ledger
            .approve_from_signer(signer, spender, amount)
            .await?;
        let receipt = wait_for_receipt(self.ledger.as_ref(), tx, &self.policy).await?;
        if !receipt.success {
            warn!("Approval of {amount} by {signer} reverted in {tx}");
            return Err(Error::LedgerRejected(format!("approval reverted in {tx}")));
        }
        debug!("Signer {signer} approved {spender} for {amount} in {tx}");
        Ok(tx)
    }

    /// Make sure `spender` may pull at least `required` from `signer`.
    ///
    /// When the current approval falls short, approves `ceiling` (or
    /// `required` if larger) and waits for it.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::authorize_spend`] and the approval read.
    pub async fn ensure_spend_authorized(
        &self,
        signer: Address,
        spender: Address,
        required: U256,
        ceiling: U256,
    ) -> Result<Option<TxHash>> {
        let current = self.ledger.token_allowance(signer, spender).await?;
        if current >= required {
            debug!("Signer {signer} already approved {current} (need {required})");
            return Ok(None);
        }
        let amount = ceiling.max(required);
        self.authorize_spend(signer, spender, amount).await.map(Some)
    }
}

impl std::fmt::Debug for AllowanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllowanceClient")
            .field("ledger", &self.ledger.addresses())
            .field("policy", &self.policy)
            .finish()
    }
}
