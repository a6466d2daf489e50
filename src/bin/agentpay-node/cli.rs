//! Command-line interface definition.

use agentpay::config::{GatewayConfig, LedgerBackend};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Pay-per-access gateway releasing AI analyses after on-chain settlement.
#[derive(Parser, Debug)]
#[command(name = "agentpay-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// HTTP listen address.
    #[arg(long, short, env = "AGENTPAY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Ledger backend.
    #[arg(long, value_enum, env = "AGENTPAY_LEDGER")]
    pub ledger: Option<CliLedgerBackend>,

    /// JSON-RPC endpoint of the EVM chain.
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Option<String>,

    /// Operator private key (hex). Submits signer-manager calls.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub operator_key: Option<String>,

    /// Ledger contract receiving payments and emitting `ProductPaid`.
    #[arg(long, env = "X402_CONTRACT_ADDRESS")]
    pub ledger_contract: Option<String>,

    /// Settlement token contract.
    #[arg(long, env = "USDC_ADDRESS")]
    pub token_contract: Option<String>,

    /// Delegated signer manager contract.
    #[arg(long, env = "AGENT_MANAGER_ADDRESS")]
    pub signer_manager: Option<String>,

    /// Confirmations required before a settlement counts.
    #[arg(long, env = "AGENTPAY_CONFIRMATIONS")]
    pub confirmations: Option<u64>,

    /// Price per resource in whole tokens, e.g. `0.001`.
    #[arg(long, env = "AGENTPAY_PRICE")]
    pub price: Option<String>,

    /// Base URL of the product catalog API.
    #[arg(long, env = "AGENTPAY_CATALOG_URL")]
    pub catalog_url: Option<String>,

    /// Seconds between catalog refreshes (0 disables).
    #[arg(long, env = "AGENTPAY_CATALOG_REFRESH_SECS")]
    pub catalog_refresh_secs: Option<u64>,

    /// Reject free-text requests that match no product instead of falling back.
    #[arg(long, env = "AGENTPAY_REQUIRE_DIRECT_ID")]
    pub require_direct_id: bool,

    /// Analysis `generateContent` endpoint.
    #[arg(long, env = "AGENTPAY_ANALYSIS_ENDPOINT")]
    pub analysis_endpoint: Option<String>,

    /// Bearer token for the analysis endpoint.
    #[arg(long, env = "AGENTPAY_ANALYSIS_TOKEN", hide_env_values = true)]
    pub analysis_token: Option<String>,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "AGENTPAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Write the effective configuration (without secrets) to this path and exit.
    #[arg(long)]
    pub write_config: Option<PathBuf>,
}

/// Ledger backend CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliLedgerBackend {
    /// EVM chain over JSON-RPC.
    Evm,
    /// In-process chain for local development.
    Memory,
}

impl Cli {
    /// Convert CLI arguments into a `GatewayConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<GatewayConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            GatewayConfig::from_file(path)?
        } else {
            GatewayConfig::default()
        };

        // Override with CLI arguments
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(backend) = self.ledger {
            config.ledger.backend = backend.into();
        }
        if let Some(rpc_url) = self.rpc_url {
            config.ledger.rpc_url = rpc_url;
        }
        if let Some(confirmations) = self.confirmations {
            config.ledger.confirmations = confirmations;
        }
        config.ledger.operator_key = self.operator_key.or(config.ledger.operator_key);
        config.ledger.ledger_contract = self.ledger_contract.or(config.ledger.ledger_contract);
        config.ledger.token_contract = self.token_contract.or(config.ledger.token_contract);
        config.ledger.signer_manager = self.signer_manager.or(config.ledger.signer_manager);

        if let Some(price) = self.price {
            config.pricing.price_per_resource = price;
        }

        if let Some(url) = self.catalog_url {
            config.catalog.source_url = url;
        }
        if let Some(secs) = self.catalog_refresh_secs {
            config.catalog.refresh_interval_secs = secs;
        }
        config.catalog.require_direct_id |= self.require_direct_id;

        config.analysis.endpoint = self.analysis_endpoint.or(config.analysis.endpoint);
        config.analysis.api_key = self.analysis_token.or(config.analysis.api_key);

        config.log_level = self.log_level;

        Ok(config)
    }
}

impl From<CliLedgerBackend> for LedgerBackend {
    fn from(b: CliLedgerBackend) -> Self {
        match b {
            CliLedgerBackend::Evm => LedgerBackend::Evm,
            CliLedgerBackend::Memory => LedgerBackend::Memory,
        }
    }
}
