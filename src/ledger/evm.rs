//! EVM ledger backend over JSON-RPC.
//!
//! The operator key signs every write. Agent-side actions (approve, pay)
//! are relayed through the signer manager's `executeFromAgent`, which
//! enforces the agent's daily limit on-chain.

use super::{
    ContractAddresses, IAgentManager, IERC20, Ledger, LedgerReceipt, PaymentCall,
};
use crate::error::{Error, Result};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::fmt::Display;
use std::future::IntoFuture;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ledger backend talking to an EVM chain.
pub struct EvmLedger {
    provider: DynProvider,
    addresses: ContractAddresses,
    operator: Address,
    rpc_timeout: Duration,
}

impl EvmLedger {
    /// Connect to `rpc_url`, signing with `operator_key`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL or key cannot be parsed.
    pub fn connect(
        rpc_url: &str,
        operator_key: &str,
        addresses: ContractAddresses,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let url: reqwest::Url = rpc_url
            .parse()
            .map_err(|e| Error::Config(format!("invalid RPC URL {rpc_url}: {e}")))?;
        let signer: PrivateKeySigner = operator_key
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid operator key: {e}")))?;
        let operator = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        info!(
            "EVM ledger connected to {} (operator={}, ledger_contract={})",
            rpc_url, operator, addresses.ledger_contract
        );

        Ok(Self {
            provider,
            addresses,
            operator,
            rpc_timeout,
        })
    }

    /// Address of the operator identity.
    #[must_use]
    pub fn operator(&self) -> Address {
        self.operator
    }

    async fn read<T, E, F>(&self, what: &str, fut: F) -> Result<T>
    where
        E: Display,
        F: IntoFuture<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{what} failed: {e}");
                Err(Error::TransientLedger(format!("{what} failed: {e}")))
            }
            Err(_) => {
                warn!("{what} timed out after {:?}", self.rpc_timeout);
                Err(Error::TransientLedger(format!("{what} timed out")))
            }
        }
    }

    async fn execute_from_agent(
        &self,
        what: &str,
        agent: Address,
        target: Address,
        data: Vec<u8>,
        amount: U256,
    ) -> Result<TxHash> {
        let manager = IAgentManager::new(self.addresses.signer_manager, self.provider.clone());
        let call = manager.executeFromAgent(agent, target, U256::ZERO, data.into(), amount);

        match tokio::time::timeout(self.rpc_timeout, call.send()).await {
            Ok(Ok(pending)) => {
                let tx = *pending.tx_hash();
                debug!("{what} broadcast as {tx}");
                Ok(tx)
            }
            Ok(Err(e)) => Err(classify_send_error(what, e)),
            Err(_) => {
                warn!("{what} broadcast timed out after {:?}", self.rpc_timeout);
                Err(Error::TransientLedger(format!("{what} broadcast timed out")))
            }
        }
    }
}

/// Execution failures surface while the node estimates gas, before anything
/// is broadcast. Those are ledger rejections; everything else is transport.
fn classify_send_error(what: &str, err: alloy::contract::Error) -> Error {
    if err.as_revert_data().is_some() {
        warn!("{what} rejected by contract: {err}");
        return Error::LedgerRejected(format!("{what} rejected by contract"));
    }
    match err {
        alloy::contract::Error::TransportError(rpc) if rpc.as_error_resp().is_some() => {
            warn!("{what} rejected by node: {rpc}");
            Error::LedgerRejected(format!("{what} rejected by node"))
        }
        other => {
            warn!("{what} failed: {other}");
            Error::TransientLedger(format!("{what} failed: {other}"))
        }
    }
}

#[async_trait]
impl Ledger for EvmLedger {
    fn addresses(&self) -> ContractAddresses {
        self.addresses
    }

    async fn signer_of(&self, principal: Address) -> Result<Option<Address>> {
        let manager = IAgentManager::new(self.addresses.signer_manager, self.provider.clone());
        let agent = self
            .read("userToAgent", manager.userToAgent(principal).call())
            .await?;
        Ok((!agent.is_zero()).then_some(agent))
    }

    async fn create_signer(&self, principal: Address, daily_limit: U256) -> Result<TxHash> {
        let manager = IAgentManager::new(self.addresses.signer_manager, self.provider.clone());
        let call = manager.createAgent(principal, daily_limit);
        match tokio::time::timeout(self.rpc_timeout, call.send()).await {
            Ok(Ok(pending)) => Ok(*pending.tx_hash()),
            Ok(Err(e)) => Err(classify_send_error("createAgent", e)),
            Err(_) => Err(Error::TransientLedger("createAgent broadcast timed out".to_string())),
        }
    }

    async fn token_balance(&self, account: Address) -> Result<U256> {
        let token = IERC20::new(self.addresses.token, self.provider.clone());
        self.read("balanceOf", token.balanceOf(account).call()).await
    }

    async fn token_allowance(&self, owner: Address, spender: Address) -> Result<U256> {
        let token = IERC20::new(self.addresses.token, self.provider.clone());
        self.read("allowance", token.allowance(owner, spender).call())
            .await
    }

    async fn remaining_daily_allowance(&self, signer: Address) -> Result<U256> {
        let manager = IAgentManager::new(self.addresses.signer_manager, self.provider.clone());
        self.read(
            "remainingDailyAllowance",
            manager.remainingDailyAllowance(signer).call(),
        )
        .await
    }

    async fn approve_from_signer(
        &self,
        signer: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxHash> {
        let data = IERC20::approveCall { spender, amount }.abi_encode();
        self.execute_from_agent("approve", signer, self.addresses.token, data, U256::ZERO)
            .await
    }

    async fn pay_from_signer(
        &self,
        signer: Address,
        call: &PaymentCall,
        amount: U256,
    ) -> Result<TxHash> {
        self.execute_from_agent(
            "payForProduct",
            signer,
            self.addresses.ledger_contract,
            call.calldata().to_vec(),
            amount,
        )
        .await
    }

    async fn receipt(&self, tx: TxHash) -> Result<Option<LedgerReceipt>> {
        let receipt = self
            .read(
                "eth_getTransactionReceipt",
                self.provider.get_transaction_receipt(tx),
            )
            .await?;

        Ok(receipt.and_then(|r| {
            let block_number = r.block_number?;
            Some(LedgerReceipt {
                tx_hash: r.transaction_hash,
                success: r.status(),
                block_number,
                logs: r.inner.logs().iter().map(|log| log.inner.clone()).collect(),
            })
        }))
    }

    async fn block_number(&self) -> Result<u64> {
        self.read("eth_blockNumber", self.provider.get_block_number())
            .await
    }
}
