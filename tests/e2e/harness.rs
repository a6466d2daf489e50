//! Test harness wiring a node to an in-memory chain.
//!
//! The `TestHarness` builds a real `RunningNode` through `NodeBuilder`, with
//! the ledger, catalog source and analysis collaborator replaced by
//! in-process doubles the tests can inspect and fault.

use agentpay::analysis::{AnalysisClient, AnalysisTask};
use agentpay::catalog::{CatalogEntry, StaticCatalogSource};
use agentpay::config::{GatewayConfig, LedgerBackend};
use agentpay::event::GatewayEventsChannel;
use agentpay::ledger::{Ledger, MemoryLedger};
use agentpay::{AccessGateway, NodeBuilder, RunningNode};
use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use axum::Router;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Price per access in base units (`0.001` of a 6-decimal token).
pub const PRICE: u64 = 1_000;

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Node failed to build or start.
    #[error("Node error: {0}")]
    Node(#[from] agentpay::Error),

    /// The ledger did not record a signer.
    #[error("No signer recorded for {0}")]
    MissingSigner(Address),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Analysis collaborator that answers from a template and counts calls.
#[derive(Default)]
pub struct ScriptedAnalysis {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl ScriptedAnalysis {
    /// Number of analyses requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every later call fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnalysisClient for ScriptedAnalysis {
    async fn analyze(&self, task: &AnalysisTask, entry: &CatalogEntry) -> agentpay::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(agentpay::Error::AnalysisFailed("scripted failure".to_string()));
        }
        Ok(format!("{} for {}", task.label(), entry.title))
    }
}

/// Hex personal signature of `message` by `key`, as a wallet would send it.
pub fn sign(key: &PrivateKeySigner, message: &str) -> String {
    let signature = key
        .sign_message_sync(message.as_bytes())
        .expect("local key signs");
    format!("0x{}", hex::encode(signature.as_bytes()))
}

/// Products every harness starts with.
pub fn sample_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new(1, "Red Lipstick", "beauty", "Long-lasting matte colour"),
        CatalogEntry::new(2, "Blue Mascara", "beauty", "Volumising mascara"),
        CatalogEntry::new(3, "Smartphone X", "smartphones", "Six inch display"),
        CatalogEntry::new(4, "Laptop Stand", "laptops", "Aluminium stand"),
        CatalogEntry::new(5, "Essence Perfume", "fragrances", "Floral scent"),
    ]
}

/// A node on an in-memory chain.
pub struct TestHarness {
    node: RunningNode,
    ledger: Arc<MemoryLedger>,
    analysis: Arc<ScriptedAnalysis>,
}

impl TestHarness {
    /// Build a node with the default configuration and load the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to build.
    pub async fn setup() -> Result<Self> {
        Self::setup_with_config(Self::default_config()).await
    }

    /// Configuration used by [`Self::setup`].
    pub fn default_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.server.listen = ([127, 0, 0, 1], 0).into();
        config.ledger.backend = LedgerBackend::Memory;
        config.ledger.confirmation_timeout_secs = 1;
        config.ledger.poll_interval_ms = 10;
        config
    }

    /// Build a node with `config` and load the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to build.
    pub async fn setup_with_config(config: GatewayConfig) -> Result<Self> {
        let ledger = Arc::new(MemoryLedger::new());
        let analysis = Arc::new(ScriptedAnalysis::default());

        let node = NodeBuilder::new(config)
            .with_ledger(ledger.clone())
            .with_analysis(analysis.clone())
            .with_catalog_source(Arc::new(StaticCatalogSource::new(sample_catalog())))
            .build()
            .await?;
        let entries = node.refresh_catalog().await?;
        info!("Test harness ready with {entries} catalog entries");

        Ok(Self {
            node,
            ledger,
            analysis,
        })
    }

    /// The node's gateway.
    pub fn gateway(&self) -> &Arc<AccessGateway> {
        self.node.gateway()
    }

    /// The node's HTTP router.
    pub fn router(&self) -> Router {
        self.node.router()
    }

    /// The in-memory chain.
    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// The scripted collaborator.
    pub fn analysis(&self) -> &Arc<ScriptedAnalysis> {
        &self.analysis
    }

    /// Subscribe to node events.
    pub fn events(&self) -> GatewayEventsChannel {
        self.node.subscribe_events()
    }

    /// Give `principal` a delegated signer with `daily_limit` and `balance` base units.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger refuses the signer.
    pub async fn onboard(&self, principal: Address, daily_limit: u64, balance: u64) -> Result<Address> {
        self.ledger
            .create_signer(principal, U256::from(daily_limit))
            .await?;
        let signer = self
            .ledger
            .signer_of(principal)
            .await?
            .ok_or(HarnessError::MissingSigner(principal))?;
        self.ledger.fund(signer, U256::from(balance));
        Ok(signer)
    }
}
