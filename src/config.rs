//! Configuration for agentpay-node.

use crate::error::{Error, Result};
use crate::ledger::{ConfirmationPolicy, ContractAddresses};
use alloy::primitives::utils::parse_units;
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Which ledger backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// EVM chain over JSON-RPC.
    #[default]
    Evm,
    /// In-process chain for local development.
    Memory,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Ledger connection and confirmation policy.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Server-side pricing.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Catalog source and resolution policy.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Analysis collaborator.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Settlement bookkeeping.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

/// Ledger connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: LedgerBackend,

    /// JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Pay-per-access contract address.
    #[serde(default)]
    pub ledger_contract: Option<String>,

    /// Payment token address.
    #[serde(default)]
    pub token_contract: Option<String>,

    /// Signer manager address.
    #[serde(default)]
    pub signer_manager: Option<String>,

    /// Operator private key. Never written back to disk.
    #[serde(default, skip_serializing)]
    pub operator_key: Option<String>,

    /// Timeout for a single RPC call in seconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Confirmations required before acting on a transaction.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Upper bound on waiting for confirmations in seconds.
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    /// Receipt poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Server-side pricing. Amounts are decimal strings in whole tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Price of one analysis or dataset release.
    #[serde(default = "default_price")]
    pub price_per_resource: String,

    /// Decimals of the payment token.
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,

    /// Daily limit given to newly created agents.
    #[serde(default = "default_daily_allowance")]
    pub default_daily_allowance: String,

    /// Approval granted to the ledger contract when the current one runs short.
    #[serde(default = "default_approval_amount")]
    pub approval_amount: String,
}

/// Catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the product source.
    #[serde(default = "default_catalog_url")]
    pub source_url: String,

    /// Page size when fetching products.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Rebuild interval in seconds (0 disables periodic rebuilds).
    #[serde(default)]
    pub refresh_interval_secs: u64,

    /// Id used when free text matches nothing.
    #[serde(default = "default_resource_id")]
    pub default_resource_id: u64,

    /// Reject unresolvable free text instead of using the default id.
    #[serde(default)]
    pub require_direct_id: bool,
}

/// Analysis collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// `generateContent` endpoint URL.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bearer token. Never written back to disk.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
}

/// Settlement bookkeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Number of consumed settlements remembered for replay protection.
    #[serde(default = "default_consumed_capacity")]
    pub consumed_cache_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ledger: LedgerConfig::default(),
            pricing: PricingConfig::default(),
            catalog: CatalogConfig::default(),
            analysis: AnalysisConfig::default(),
            payment: PaymentConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            rpc_url: default_rpc_url(),
            ledger_contract: None,
            token_contract: None,
            signer_manager: None,
            operator_key: None,
            rpc_timeout_secs: default_rpc_timeout(),
            confirmations: default_confirmations(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            price_per_resource: default_price(),
            token_decimals: default_token_decimals(),
            default_daily_allowance: default_daily_allowance(),
            approval_amount: default_approval_amount(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            source_url: default_catalog_url(),
            page_size: default_page_size(),
            refresh_interval_secs: 0,
            default_resource_id: default_resource_id(),
            require_direct_id: false,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_analysis_timeout(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            consumed_cache_capacity: default_consumed_capacity(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_rpc_url() -> String {
    "https://rpc.testnet.arc.network".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_price() -> String {
    "0.001".to_string()
}

fn default_daily_allowance() -> String {
    "10".to_string()
}

fn default_approval_amount() -> String {
    "1000000".to_string()
}

fn default_catalog_url() -> String {
    "https://dummyjson.com".to_string()
}

const fn default_token_decimals() -> u8 {
    6
}

const fn default_rpc_timeout() -> u64 {
    15
}

const fn default_confirmations() -> u64 {
    1
}

const fn default_confirmation_timeout() -> u64 {
    120
}

const fn default_poll_interval() -> u64 {
    1000
}

const fn default_page_size() -> usize {
    100
}

const fn default_resource_id() -> u64 {
    1
}

const fn default_analysis_timeout() -> u64 {
    60
}

const fn default_consumed_capacity() -> usize {
    100_000
}

/// Parse a non-negative decimal token amount into base units.
///
/// # Errors
///
/// Returns a configuration error for negative or malformed amounts.
pub fn parse_token_amount(amount: &str, decimals: u8) -> Result<U256> {
    let amount = amount.trim();
    if amount.starts_with('-') {
        return Err(Error::Config(format!("amount must not be negative: {amount}")));
    }
    parse_units(amount, decimals)
        .map(|units| units.get_absolute())
        .map_err(|e| Error::Config(format!("invalid token amount {amount:?}: {e}")))
}

fn parse_address(name: &str, value: Option<&String>) -> Result<Address> {
    let value = value.ok_or_else(|| Error::Config(format!("{name} address is not configured")))?;
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {name} address {value}: {e}")))
}

impl LedgerConfig {
    /// Parsed contract addresses. The memory backend falls back to fixed local ones.
    ///
    /// # Errors
    ///
    /// Returns an error if an address is missing or malformed on the EVM backend.
    pub fn addresses(&self) -> Result<ContractAddresses> {
        if self.backend == LedgerBackend::Memory
            && self.ledger_contract.is_none()
            && self.token_contract.is_none()
            && self.signer_manager.is_none()
        {
            return Ok(ContractAddresses::local());
        }
        Ok(ContractAddresses {
            ledger_contract: parse_address("ledger contract", self.ledger_contract.as_ref())?,
            token: parse_address("token contract", self.token_contract.as_ref())?,
            signer_manager: parse_address("signer manager", self.signer_manager.as_ref())?,
        })
    }

    /// Confirmation policy derived from this configuration.
    #[must_use]
    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            confirmations: self.confirmations.max(1),
            timeout: Duration::from_secs(self.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }

    /// Timeout for a single RPC call.
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.max(1))
    }
}

impl PricingConfig {
    /// Price per resource in base units.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured price is malformed or zero.
    pub fn price(&self) -> Result<U256> {
        let price = parse_token_amount(&self.price_per_resource, self.token_decimals)?;
        if price.is_zero() {
            return Err(Error::Config("price per resource must be non-zero".to_string()));
        }
        Ok(price)
    }

    /// Default agent daily limit in base units.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured amount is malformed.
    pub fn daily_allowance(&self) -> Result<U256> {
        parse_token_amount(&self.default_daily_allowance, self.token_decimals)
    }

    /// Approval ceiling in base units.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured amount is malformed.
    pub fn approval(&self) -> Result<U256> {
        parse_token_amount(&self.approval_amount, self.token_decimals)
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file. Secrets are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every derived value once at startup.
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found.
    pub fn validate(&self) -> Result<()> {
        self.pricing.price()?;
        self.pricing.daily_allowance()?;
        self.pricing.approval()?;
        self.ledger.addresses()?;
        if self.ledger.backend == LedgerBackend::Evm && self.ledger.operator_key.is_none() {
            return Err(Error::Config("operator key is required for the EVM backend".to_string()));
        }
        if self.catalog.page_size == 0 {
            return Err(Error::Config("catalog page size must be non-zero".to_string()));
        }
        Ok(())
    }
}
