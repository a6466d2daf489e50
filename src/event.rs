//! Gateway event system.

use alloy::primitives::{Address, TxHash};
use tokio::sync::broadcast;

/// Events emitted by the gateway and node.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Node has started successfully.
    Started,

    /// Node is shutting down.
    ShuttingDown,

    /// Catalog index was rebuilt.
    CatalogRebuilt {
        /// Entries in the new snapshot.
        entries: usize,
    },

    /// A payment was broadcast through a delegated signer.
    SettlementBroadcast {
        /// Paying principal.
        principal: Address,
        /// Resource paid for.
        resource_id: u64,
        /// Transaction reference.
        tx_hash: TxHash,
    },

    /// A settlement was confirmed with a matching payment event.
    SettlementVerified {
        /// Transaction reference.
        tx_hash: TxHash,
        /// Resource paid for.
        resource_id: u64,
    },

    /// A broadcast settlement could not be verified.
    SettlementUnverified {
        /// Transaction reference.
        tx_hash: TxHash,
        /// Why verification failed.
        reason: String,
    },

    /// A gated resource was released.
    AccessGranted {
        /// Settlement that paid for it.
        tx_hash: TxHash,
        /// Resource released.
        resource_id: u64,
    },

    /// A request ended in a rejection.
    RequestRejected {
        /// State the request was in.
        state: String,
        /// Machine-readable reason.
        reason: String,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving gateway events.
pub type GatewayEventsChannel = broadcast::Receiver<GatewayEvent>;

/// Sender for gateway events.
pub type GatewayEventsSender = broadcast::Sender<GatewayEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (GatewayEventsSender, GatewayEventsChannel) {
    broadcast::channel(256)
}
