//! Node implementation - wires the ledger, catalog, settlement and HTTP layers.

use crate::allowance::AllowanceClient;
use crate::analysis::{AnalysisClient, HttpAnalysisClient};
use crate::catalog::{CatalogIndex, CatalogSource, HttpCatalogSource};
use crate::config::{GatewayConfig, LedgerBackend};
use crate::error::{Error, Result};
use crate::event::{create_event_channel, GatewayEvent, GatewayEventsChannel, GatewayEventsSender};
use crate::gateway::{AccessGateway, GatewayPolicy};
use crate::ledger::{EvmLedger, MemoryLedger, SharedLedger};
use crate::payment::{ConsumedSettlements, SettlementExecutor, SettlementVerifier};
use crate::server::{self, AppState};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Timeout for each catalog page request.
const CATALOG_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for constructing a gateway node.
///
/// Collaborators default to what the configuration names; the `with_*`
/// methods replace them, which is how tests run against an in-memory chain.
pub struct NodeBuilder {
    config: GatewayConfig,
    ledger: Option<SharedLedger>,
    analysis: Option<Arc<dyn AnalysisClient>>,
    catalog_source: Option<Arc<dyn CatalogSource>>,
}

impl NodeBuilder {
    /// Create a new node builder with the given configuration.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            ledger: None,
            analysis: None,
            catalog_source: None,
        }
    }

    /// Use `ledger` instead of the configured backend.
    #[must_use]
    pub fn with_ledger(mut self, ledger: SharedLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use `analysis` instead of the configured endpoint.
    #[must_use]
    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisClient>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// Use `source` instead of the configured catalog URL.
    #[must_use]
    pub fn with_catalog_source(mut self, source: Arc<dyn CatalogSource>) -> Self {
        self.catalog_source = Some(source);
        self
    }

    fn connect_ledger(config: &GatewayConfig) -> Result<SharedLedger> {
        let ledger = &config.ledger;
        let addresses = ledger.addresses()?;
        match ledger.backend {
            LedgerBackend::Evm => {
                let key = ledger.operator_key.as_deref().ok_or_else(|| {
                    Error::Config("operator key is required for the EVM backend".to_string())
                })?;
                let evm = EvmLedger::connect(&ledger.rpc_url, key, addresses, ledger.rpc_timeout())?;
                Ok(Arc::new(evm))
            }
            LedgerBackend::Memory => {
                warn!("Using the in-memory ledger; settlements are not real");
                Ok(Arc::new(MemoryLedger::with_addresses(addresses)))
            }
        }
    }

    /// Build the node and bind its listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a collaborator
    /// cannot be created, or the listen address cannot be bound.
    pub async fn build(self) -> Result<RunningNode> {
        info!(
            "Building agentpay-node (backend={:?}, listen={})",
            self.config.ledger.backend, self.config.server.listen
        );

        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => {
                self.config.validate()?;
                Self::connect_ledger(&self.config)?
            }
        };

        let price = self.config.pricing.price()?;
        let default_daily_limit = self.config.pricing.daily_allowance()?;
        let approval = self.config.pricing.approval()?;
        let policy = self.config.ledger.confirmation_policy();

        let analysis: Arc<dyn AnalysisClient> = match self.analysis {
            Some(analysis) => analysis,
            None => {
                let endpoint = self.config.analysis.endpoint.as_deref().ok_or_else(|| {
                    Error::Config("analysis endpoint is not configured".to_string())
                })?;
                Arc::new(HttpAnalysisClient::new(
                    endpoint,
                    self.config.analysis.api_key.clone(),
                    Duration::from_secs(self.config.analysis.timeout_secs),
                )?)
            }
        };

        let catalog_source: Arc<dyn CatalogSource> = match self.catalog_source {
            Some(source) => source,
            None => Arc::new(HttpCatalogSource::new(
                &self.config.catalog.source_url,
                self.config.catalog.page_size,
                CATALOG_FETCH_TIMEOUT,
            )?),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let allowance = AllowanceClient::new(Arc::clone(&ledger), policy);
        let gateway = Arc::new(AccessGateway::new(
            Arc::new(CatalogIndex::new()),
            Arc::new(SettlementExecutor::new(allowance.clone(), approval)),
            Arc::new(SettlementVerifier::new(ledger, policy)),
            analysis,
            ConsumedSettlements::with_capacity(self.config.payment.consumed_cache_capacity),
            GatewayPolicy {
                price,
                default_resource_id: self.config.catalog.default_resource_id,
                require_direct_id: self.config.catalog.require_direct_id,
            },
            events_tx.clone(),
        ));

        let state = Arc::new(AppState {
            gateway: Arc::clone(&gateway),
            allowance,
            token_decimals: self.config.pricing.token_decimals,
            default_daily_limit,
        });

        let listener = TcpListener::bind(self.config.server.listen).await?;

        Ok(RunningNode {
            config: self.config,
            gateway,
            router: server::create_router(state),
            catalog_source,
            listener: Some(listener),
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// A running gateway node.
pub struct RunningNode {
    config: GatewayConfig,
    gateway: Arc<AccessGateway>,
    router: Router,
    catalog_source: Arc<dyn CatalogSource>,
    listener: Option<TcpListener>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: GatewayEventsSender,
    events_rx: Option<GatewayEventsChannel>,
}

impl RunningNode {
    /// Address the HTTP listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the node already ran or the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or_else(|| Error::Server("listener already consumed".to_string()))?
            .local_addr()
            .map_err(Error::from)
    }

    /// The request gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<AccessGateway> {
        &self.gateway
    }

    /// The HTTP router, for serving elsewhere or driving in tests.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Get a receiver for node events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<GatewayEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to node events.
    #[must_use]
    pub fn subscribe_events(&self) -> GatewayEventsChannel {
        self.events_tx.subscribe()
    }

    /// Sender that stops the node when `true` is sent.
    #[must_use]
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Fetch the catalog and rebuild the index once.
    ///
    /// # Errors
    ///
    /// Returns the catalog source's error; the previous index stays live.
    pub async fn refresh_catalog(&self) -> Result<usize> {
        refresh_catalog(&self.gateway, self.catalog_source.as_ref(), &self.events_tx).await
    }

    /// Run the node until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the node already ran or the HTTP server fails.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::Server("node is already running".to_string()))?;

        info!("Starting agentpay-node");
        let _ = self.events_tx.send(GatewayEvent::Started);

        if let Err(e) = self.refresh_catalog().await {
            warn!("Initial catalog load failed, serving an empty index: {e}");
        }

        let refresh_secs = self.config.catalog.refresh_interval_secs;
        if refresh_secs > 0 {
            let gateway = Arc::clone(&self.gateway);
            let source = Arc::clone(&self.catalog_source);
            let events_tx = self.events_tx.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(refresh_secs));
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {
                            if let Err(e) = refresh_catalog(&gateway, source.as_ref(), &events_tx).await {
                                warn!("Catalog refresh failed, keeping previous index: {e}");
                            }
                        }
                    }
                }
            });
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let shutdown = async move {
            tokio::select! {
                () = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    let _ = shutdown_tx.send(true);
                }
            }
        };

        let served = server::serve(listener, self.router.clone(), shutdown).await;
        if let Err(ref e) = served {
            let _ = self.events_tx.send(GatewayEvent::Error {
                message: format!("HTTP server failed: {e}"),
            });
        }

        let _ = self.events_tx.send(GatewayEvent::ShuttingDown);
        let stats = self.gateway.consumed().stats();
        info!(
            "Node shutdown complete ({} settlements consumed, {} replays rejected)",
            stats.consumed, stats.replays_rejected
        );
        served
    }

    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn refresh_catalog(
    gateway: &AccessGateway,
    source: &dyn CatalogSource,
    events_tx: &GatewayEventsSender,
) -> Result<usize> {
    match gateway.catalog().refresh_from(source).await {
        Ok(snapshot) => {
            let entries = snapshot.len();
            let _ = events_tx.send(GatewayEvent::CatalogRebuilt { entries });
            Ok(entries)
        }
        Err(e) => {
            let _ = events_tx.send(GatewayEvent::Error {
                message: format!("Catalog refresh failed: {e}"),
            });
            Err(e)
        }
    }
}
