//! In-process ledger with the same contract rules as the EVM deployment.
//!
//! Every accepted submission is mined into its own block immediately.
//! Rejections happen at submission time, the way gas estimation rejects a
//! failing call on a real node. Faults can be queued to exercise revert,
//! broadcast failure and mismatched settlement paths.

use super::{ContractAddresses, IAgenticCommerce, Ledger, LedgerReceipt, PaymentCall};
use crate::error::{Error, Result};
use alloy::primitives::{keccak256, Address, Log, TxHash, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Fault applied to the next payment submitted to a [`MemoryLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerFault {
    /// Mine the payment with a failed status and no state change.
    RevertNextPayment,
    /// Fail the broadcast with a transient RPC error.
    FailNextBroadcast,
    /// Emit the settlement event for another product.
    MisattributeNextPayment {
        /// Product id written into the event.
        resource_id: u64,
    },
    /// Emit the settlement event with a smaller amount.
    UnderreportNextPayment {
        /// Amount written into the event.
        amount: U256,
    },
    /// Accept the payment but never publish its receipt.
    DropNextReceipt,
}

#[derive(Debug)]
struct AgentAccount {
    daily_limit: U256,
    spent_today: U256,
}

#[derive(Debug, Default)]
struct ChainState {
    head: u64,
    tx_counter: u64,
    agents: HashMap<Address, Address>,
    accounts: HashMap<Address, AgentAccount>,
    balances: HashMap<Address, U256>,
    approvals: HashMap<(Address, Address), U256>,
    receipts: HashMap<TxHash, LedgerReceipt>,
    hidden: HashSet<TxHash>,
    faults: VecDeque<LedgerFault>,
    payments: u64,
}

impl ChainState {
    fn next_tx(&mut self) -> TxHash {
        self.tx_counter += 1;
        keccak256(self.tx_counter.to_be_bytes())
    }

    fn mine(&mut self, success: bool, logs: Vec<Log>) -> TxHash {
        let tx_hash = self.next_tx();
        self.head += 1;
        self.receipts.insert(
            tx_hash,
            LedgerReceipt {
                tx_hash,
                success,
                block_number: self.head,
                logs,
            },
        );
        tx_hash
    }

    fn take_fault(&mut self) -> Option<LedgerFault> {
        self.faults.pop_front()
    }
}

/// In-memory ledger backend.
pub struct MemoryLedger {
    addresses: ContractAddresses,
    state: Mutex<ChainState>,
}

impl MemoryLedger {
    /// Create an empty chain with [`ContractAddresses::local`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_addresses(ContractAddresses::local())
    }

    /// Create an empty chain bound to the given contract addresses.
    #[must_use]
    pub fn with_addresses(addresses: ContractAddresses) -> Self {
        Self {
            addresses,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Credit `account` with tokens (a principal funding its agent).
    pub fn fund(&self, account: Address, amount: U256) {
        let mut state = self.state.lock();
        let balance = state.balances.entry(account).or_default();
        *balance = balance.saturating_add(amount);
    }

    /// Advance the head by `count` empty blocks.
    pub fn mine_blocks(&self, count: u64) {
        self.state.lock().head += count;
    }

    /// Start a new allowance day for every agent.
    pub fn reset_daily_allowances(&self) {
        for account in self.state.lock().accounts.values_mut() {
            account.spent_today = U256::ZERO;
        }
    }

    /// Queue a fault for the next payment.
    pub fn inject(&self, fault: LedgerFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Number of payments that were accepted for broadcast.
    #[must_use]
    pub fn payments_submitted(&self) -> u64 {
        self.state.lock().payments
    }

    /// Record a raw mined transaction carrying `logs`.
    pub fn record_transaction(&self, success: bool, logs: Vec<Log>) -> TxHash {
        self.state.lock().mine(success, logs)
    }

    fn agent_address(principal: Address) -> Address {
        let digest = keccak256(principal);
        Address::from_slice(&digest[12..])
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn addresses(&self) -> ContractAddresses {
        self.addresses
    }

    async fn signer_of(&self, principal: Address) -> Result<Option<Address>> {
        let agent = self
            .state
            .lock()
            .agents
            .get(&principal)
            .copied()
            .unwrap_or(Address::ZERO);
        Ok((!agent.is_zero()).then_some(agent))
    }

    async fn create_signer(&self, principal: Address, daily_limit: U256) -> Result<TxHash> {
        let mut state = self.state.lock();
        if state.agents.contains_key(&principal) {
            return Err(Error::LedgerRejected(format!(
                "principal {principal} already has an agent"
            )));
        }
        if daily_limit.is_zero() {
            return Err(Error::LedgerRejected("daily limit must be non-zero".to_string()));
        }

        let agent = Self::agent_address(principal);
        state.agents.insert(principal, agent);
        state.accounts.insert(
            agent,
            AgentAccount {
                daily_limit,
                spent_today: U256::ZERO,
            },
        );
        let tx = state.mine(true, Vec::new());
        debug!("Created agent {agent} for {principal} (daily limit {daily_limit})");
        Ok(tx)
    }

    async fn token_balance(&self, account: Address) -> Result<U256> {
        Ok(self
            .state
            .lock()
            .balances
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn token_allowance(&self, owner: Address, spender: Address) -> Result<U256> {
        Ok(self
            .state
            .lock()
            .approvals
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn remaining_daily_allowance(&self, signer: Address) -> Result<U256> {
        let state = self.state.lock();
        let account = state
            .accounts
            .get(&signer)
            .ok_or_else(|| Error::LedgerRejected(format!("{signer} is not an agent")))?;
        Ok(account.daily_limit.saturating_sub(account.spent_today))
    }

    async fn approve_from_signer(
        &self,
        signer: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxHash> {
        let mut state = self.state.lock();
        if !state.accounts.contains_key(&signer) {
            return Err(Error::LedgerRejected(format!("{signer} is not an agent")));
        }
        state.approvals.insert((signer, spender), amount);
        Ok(state.mine(true, Vec::new()))
    }

    async fn pay_from_signer(
        &self,
        signer: Address,
        call: &PaymentCall,
        amount: U256,
    ) -> Result<TxHash> {
        let ledger_contract = self.addresses.ledger_contract;
        let mut state = self.state.lock();

        let fault = state.take_fault();
        if fault == Some(LedgerFault::FailNextBroadcast) {
            return Err(Error::TransientLedger("connection reset by peer".to_string()));
        }

        let remaining = state
            .accounts
            .get(&signer)
            .map(|a| a.daily_limit.saturating_sub(a.spent_today))
            .ok_or_else(|| Error::LedgerRejected(format!("{signer} is not an agent")))?;
        if amount > remaining {
            return Err(Error::LedgerRejected(format!(
                "daily allowance exceeded: {amount} > {remaining}"
            )));
        }
        let approved = state
            .approvals
            .get(&(signer, ledger_contract))
            .copied()
            .unwrap_or_default();
        if amount > approved {
            return Err(Error::LedgerRejected(format!(
                "insufficient authorization: {amount} > {approved}"
            )));
        }
        let balance = state.balances.get(&signer).copied().unwrap_or_default();
        if amount > balance {
            return Err(Error::LedgerRejected(format!(
                "insufficient balance: {amount} > {balance}"
            )));
        }

        state.payments += 1;
        if fault == Some(LedgerFault::RevertNextPayment) {
            return Ok(state.mine(false, Vec::new()));
        }

        state.balances.insert(signer, balance - amount);
        state.approvals.insert((signer, ledger_contract), approved - amount);
        if let Some(account) = state.accounts.get_mut(&signer) {
            account.spent_today += amount;
        }
        let received = state.balances.entry(ledger_contract).or_default();
        *received = received.saturating_add(amount);

        let (product_id, reported) = match &fault {
            Some(LedgerFault::MisattributeNextPayment { resource_id }) => (*resource_id, amount),
            Some(LedgerFault::UnderreportNextPayment { amount: reported }) => {
                (call.resource_id, *reported)
            }
            _ => (call.resource_id, amount),
        };
        let event = IAgenticCommerce::ProductPaid {
            buyer: signer,
            productId: U256::from(product_id),
            amount: reported,
        };
        let log = Log {
            address: ledger_contract,
            data: event.encode_log_data(),
        };
        let tx = state.mine(true, vec![log]);
        if fault == Some(LedgerFault::DropNextReceipt) {
            state.hidden.insert(tx);
        }
        debug!("Agent {signer} paid {amount} for resource {} in {tx}", call.resource_id);
        Ok(tx)
    }

    async fn receipt(&self, tx: TxHash) -> Result<Option<LedgerReceipt>> {
        let state = self.state.lock();
        if state.hidden.contains(&tx) {
            return Ok(None);
        }
        Ok(state.receipts.get(&tx).cloned())
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.state.lock().head)
    }
}
