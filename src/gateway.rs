//! Access gateway.
//!
//! One request walks a fixed sequence of states:
//!
//! ```text
//! RESOLVING ─► PAYING ─► VERIFYING ─► DISPATCHING ─► DONE
//!     │           │           │             │
//!     └───────────┴─────┬─────┴─────────────┘
//!                       ▼
//!                REJECTED(reason)
//! ```
//!
//! The analysis is dispatched only after the verifier has re-read a matching
//! settlement event from the ledger. A settlement the gateway broadcasts is
//! reserved for its own request as soon as its hash is known, so nobody else
//! can redeem it first. Verification runs on its own task: once a payment is
//! broadcast, dropping the caller does not abandon the settlement. Its
//! outcome is still logged against the transaction hash, and the reservation
//! is lifted so the payer can redeem it through [`AccessGateway::release_dataset`].

use crate::analysis::{AnalysisClient, AnalysisTask};
use crate::catalog::{CatalogEntry, CatalogIndex};
use crate::error::Error;
use crate::event::{GatewayEvent, GatewayEventsSender};
use crate::payment::{ConsumedSettlements, PaymentEvent, SettlementExecutor, SettlementVerifier};
use alloy::primitives::{Address, TxHash, U256};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Turning the target into a catalog entry.
    Resolving,
    /// Spending through the delegated signer.
    Paying,
    /// Re-reading the settlement from the ledger.
    Verifying,
    /// Calling the analysis collaborator.
    Dispatching,
    /// Resource released.
    Done,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "RESOLVING",
            Self::Paying => "PAYING",
            Self::Verifying => "VERIFYING",
            Self::Dispatching => "DISPATCHING",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Missing or malformed input.
    BadRequest,
    /// The request is not signed by its principal.
    Unauthorized,
    /// The settlement belongs to another payer.
    PayerMismatch,
    /// Free text matched nothing and a direct id is required.
    AmbiguousResource,
    /// Unknown resource id.
    ResourceNotFound,
    /// The principal has no delegated signer.
    NoDelegatedSigner,
    /// The ledger refused the approval or payment.
    PaymentRejected,
    /// The ledger could not be reached.
    LedgerUnavailable,
    /// No matching settlement event was found.
    PaymentNotVerified,
    /// The settlement already released a resource.
    SettlementConsumed,
    /// The collaborator failed after payment.
    AnalysisFailed,
    /// Anything else.
    Internal,
}

impl RejectReason {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::PayerMismatch => "payer_mismatch",
            Self::AmbiguousResource => "ambiguous_resource",
            Self::ResourceNotFound => "resource_not_found",
            Self::NoDelegatedSigner => "no_delegated_signer",
            Self::PaymentRejected => "payment_rejected",
            Self::LedgerUnavailable => "ledger_unavailable",
            Self::PaymentNotVerified => "payment_not_verified",
            Self::SettlementConsumed => "settlement_consumed",
            Self::AnalysisFailed => "analysis_failed",
            Self::Internal => "internal",
        }
    }

    /// HTTP status for this reason.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            Self::BadRequest | Self::AmbiguousResource => 400,
            Self::Unauthorized => 401,
            Self::PayerMismatch => 403,
            Self::NoDelegatedSigner | Self::PaymentRejected | Self::PaymentNotVerified => 402,
            Self::ResourceNotFound => 404,
            Self::SettlementConsumed => 409,
            Self::AnalysisFailed | Self::Internal => 500,
            Self::LedgerUnavailable => 503,
        }
    }

    /// Classify a library error.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::BadRequest(_) => Self::BadRequest,
            Error::Unauthorized(_) => Self::Unauthorized,
            Error::PayerMismatch(_) => Self::PayerMismatch,
            Error::AmbiguousResource(_) => Self::AmbiguousResource,
            Error::ResourceNotFound(_) => Self::ResourceNotFound,
            Error::NoDelegatedSigner(_) => Self::NoDelegatedSigner,
            Error::PaymentRejected(_) | Error::LedgerRejected(_) => Self::PaymentRejected,
            Error::TransientLedger(_) | Error::TransactionNotFound(_) => Self::LedgerUnavailable,
            Error::TransactionReverted(_) | Error::PaymentNotVerified(_) => {
                Self::PaymentNotVerified
            }
            Error::SettlementConsumed(_) => Self::SettlementConsumed,
            Error::AnalysisFailed(_) => Self::AnalysisFailed,
            Error::Catalog(_) | Error::Config(_) | Error::Server(_) | Error::Io(_) => {
                Self::Internal
            }
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A request that ended in `REJECTED`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason} in {state}: {message}")]
pub struct Rejection {
    /// State the request failed in.
    pub state: GatewayState,
    /// Classified reason.
    pub reason: RejectReason,
    /// Caller-safe description. Ledger and collaborator internals stay in the logs.
    pub message: String,
    /// Settlement broadcast before the failure, if any.
    pub tx_hash: Option<TxHash>,
    /// The settlement may still confirm; check it again instead of paying again.
    pub retriable: bool,
}

impl Rejection {
    fn new(state: GatewayState, reason: RejectReason, err: &Error, tx_hash: Option<TxHash>) -> Self {
        let message = match reason {
            RejectReason::BadRequest
            | RejectReason::Unauthorized
            | RejectReason::PayerMismatch
            | RejectReason::AmbiguousResource
            | RejectReason::ResourceNotFound
            | RejectReason::NoDelegatedSigner
            | RejectReason::SettlementConsumed => err.to_string(),
            RejectReason::PaymentRejected => "Payment was refused by the ledger".to_string(),
            RejectReason::LedgerUnavailable => "Ledger is temporarily unavailable".to_string(),
            RejectReason::PaymentNotVerified => "Payment not verified".to_string(),
            RejectReason::AnalysisFailed => "Analysis failed".to_string(),
            RejectReason::Internal => "Internal error".to_string(),
        };
        Self {
            state,
            reason,
            message,
            tx_hash,
            retriable: err.is_retriable(),
        }
    }

    pub(crate) fn from_error(state: GatewayState, err: &Error, tx_hash: Option<TxHash>) -> Self {
        Self::new(state, RejectReason::from_error(err), err, tx_hash)
    }
}

/// What the caller wants access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceTarget {
    /// A catalog id.
    Id(u64),
    /// Free text resolved through the catalog index.
    Query(String),
}

/// A paid analysis request.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    /// Principal whose delegated signer pays.
    pub principal: Address,
    /// Resource to analyse.
    pub target: ResourceTarget,
    /// Mode label; `None` means the default analysis.
    pub mode: Option<String>,
    /// Question for custom research.
    pub custom_query: Option<String>,
}

/// A request that reached `DONE`.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    /// Settlement that paid for the access.
    pub tx_hash: TxHash,
    /// Resolved resource id.
    pub resource_id: u64,
    /// Task that was run.
    pub task: AnalysisTask,
    /// Collaborator output.
    pub analysis: String,
}

/// Caller-supplied evidence of an earlier payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProof {
    /// Settlement transaction.
    pub tx_hash: TxHash,
    /// Resource the caller says it paid for.
    pub resource_id: u64,
    /// Amount the caller says it paid. Informational only.
    pub claimed_amount: Option<String>,
    /// Principal that signed the proof. Its delegated signer must be the payer.
    pub payer: Address,
}

/// Server-side gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    /// Price of one access, in base units.
    pub price: U256,
    /// Resource used when free text matches nothing.
    pub default_resource_id: u64,
    /// Refuse unmatched free text instead of falling back.
    pub require_direct_id: bool,
}

/// Orchestrates resolve, pay, verify and dispatch.
pub struct AccessGateway {
    catalog: Arc<CatalogIndex>,
    executor: Arc<SettlementExecutor>,
    verifier: Arc<SettlementVerifier>,
    analysis: Arc<dyn AnalysisClient>,
    consumed: ConsumedSettlements,
    policy: GatewayPolicy,
    events: GatewayEventsSender,
}

impl AccessGateway {
    /// Wire a gateway from its collaborators.
    #[must_use]
    pub fn new(
        catalog: Arc<CatalogIndex>,
        executor: Arc<SettlementExecutor>,
        verifier: Arc<SettlementVerifier>,
        analysis: Arc<dyn AnalysisClient>,
        consumed: ConsumedSettlements,
        policy: GatewayPolicy,
        events: GatewayEventsSender,
    ) -> Self {
        Self {
            catalog,
            executor,
            verifier,
            analysis,
            consumed,
            policy,
            events,
        }
    }

    /// Catalog the gateway resolves against.
    #[must_use]
    pub fn catalog(&self) -> &Arc<CatalogIndex> {
        &self.catalog
    }

    /// Gateway settings.
    #[must_use]
    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    /// Replay guard.
    #[must_use]
    pub fn consumed(&self) -> &ConsumedSettlements {
        &self.consumed
    }

    /// Run one paid analysis request to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] naming the state the request failed in.
    pub async fn handle(&self, request: AccessRequest) -> Result<AccessGrant, Rejection> {
        let principal = request.principal;

        debug!("Request from {principal}: {}", GatewayState::Resolving);
        let (task, entry) = self
            .resolve(&request)
            .map_err(|e| self.reject(Rejection::from_error(GatewayState::Resolving, &e, None)))?;
        let resource_id = entry.id;

        debug!("Request from {principal}: {} resource {resource_id}", GatewayState::Paying);
        let record = self
            .executor
            .pay(principal, resource_id, task.label(), self.policy.price)
            .await
            .map_err(|e| {
                if e.is_retriable() {
                    warn!("Payment by {principal} for {resource_id} failed transiently: {e}");
                }
                self.reject(Rejection::from_error(GatewayState::Paying, &e, None))
            })?;
        let tx_hash = record.tx_hash;
        self.consume(GatewayState::Paying, tx_hash, resource_id)?;
        let _ = self.events.send(GatewayEvent::SettlementBroadcast {
            principal,
            resource_id,
            tx_hash,
        });

        debug!("Request from {principal}: {} {tx_hash}", GatewayState::Verifying);
        let event = self
            .verify_detached(tx_hash, resource_id, true)
            .await
            .inspect_err(|rejection| {
                if rejection.retriable {
                    self.consumed.release(&tx_hash);
                    info!("Settlement {tx_hash} still pending; left redeemable by {principal}");
                }
            })?;
        if event.buyer != record.signer {
            warn!(
                "Settlement {tx_hash} paid by {} instead of {}",
                event.buyer, record.signer
            );
            return Err(self.reject(Rejection::from_error(
                GatewayState::Verifying,
                &Error::PaymentNotVerified(tx_hash),
                Some(tx_hash),
            )));
        }

        debug!("Request from {principal}: {} {tx_hash}", GatewayState::Dispatching);
        let analysis = self.analysis.analyze(&task, &entry).await.map_err(|e| {
            error!("Analysis for paid settlement {tx_hash} failed: {e}");
            self.reject(Rejection::from_error(GatewayState::Dispatching, &e, Some(tx_hash)))
        })?;

        info!(
            "Request from {principal}: {} resource {resource_id} released for {tx_hash}",
            GatewayState::Done
        );
        let _ = self.events.send(GatewayEvent::AccessGranted {
            tx_hash,
            resource_id,
        });
        Ok(AccessGrant {
            tx_hash,
            resource_id,
            task,
            analysis,
        })
    }

    /// Release a catalog record against a settlement the caller already made.
    ///
    /// The threshold is the configured price, whatever amount the proof claims.
    /// Only the payer's principal can redeem a settlement: the verified event
    /// must name the delegated signer of `proof.payer` as buyer.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] if the resource is unknown, the settlement
    /// does not verify, was paid by someone else, or was already consumed.
    pub async fn release_dataset(&self, proof: PaymentProof) -> Result<CatalogEntry, Rejection> {
        let PaymentProof {
            tx_hash,
            resource_id,
            claimed_amount,
            payer,
        } = proof;

        let entry = self.catalog.snapshot().get(resource_id).cloned().ok_or_else(|| {
            self.reject(Rejection::from_error(
                GatewayState::Resolving,
                &Error::ResourceNotFound(resource_id),
                Some(tx_hash),
            ))
        })?;

        if let Some(claimed) = claimed_amount {
            debug!("Proof {tx_hash} claims {claimed}; checking against {}", self.policy.price);
        }

        let not_owned = || {
            self.reject(Rejection::from_error(
                GatewayState::Verifying,
                &Error::PayerMismatch(tx_hash),
                Some(tx_hash),
            ))
        };
        let signer = self
            .executor
            .allowance()
            .signer_for(payer)
            .await
            .map_err(|e| self.reject(Rejection::from_error(GatewayState::Resolving, &e, Some(tx_hash))))?
            .ok_or_else(not_owned)?;

        let event = self.verify_detached(tx_hash, resource_id, false).await?;
        if event.buyer != signer {
            warn!(
                "Proof for {tx_hash} signed by {payer}, but {} paid",
                event.buyer
            );
            return Err(not_owned());
        }
        self.consume(GatewayState::Verifying, tx_hash, resource_id)?;

        info!("Dataset {resource_id} released for {tx_hash} to {payer}");
        let _ = self.events.send(GatewayEvent::AccessGranted {
            tx_hash,
            resource_id,
        });
        Ok(entry)
    }

    fn resolve(&self, request: &AccessRequest) -> crate::Result<(AnalysisTask, CatalogEntry)> {
        let task =
            AnalysisTask::from_mode(request.mode.as_deref(), request.custom_query.as_deref())?;
        let snapshot = self.catalog.snapshot();

        let resource_id = match &request.target {
            ResourceTarget::Id(id) => *id,
            ResourceTarget::Query(text) => {
                let fallback =
                    (!self.policy.require_direct_id).then_some(self.policy.default_resource_id);
                let id = snapshot
                    .best_match(text, fallback)
                    .ok_or_else(|| Error::AmbiguousResource(text.clone()))?;
                debug!("Resolved {text:?} to resource {id}");
                id
            }
        };

        let entry = snapshot
            .get(resource_id)
            .cloned()
            .ok_or(Error::ResourceNotFound(resource_id))?;
        Ok((task, entry))
    }

    /// Verify on a spawned task so the settlement is followed up even if
    /// this future is dropped.
    ///
    /// With `reserved`, a caller that went away before the outcome arrived
    /// gets its reservation lifted, leaving the settlement to its payer.
    async fn verify_detached(
        &self,
        tx_hash: TxHash,
        resource_id: u64,
        reserved: bool,
    ) -> Result<PaymentEvent, Rejection> {
        let verifier = Arc::clone(&self.verifier);
        let events = self.events.clone();
        let consumed = self.consumed.clone();
        let price = self.policy.price;
        let (reply, reply_rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = verifier.verify_settlement(tx_hash, resource_id, price).await;
            match &outcome {
                Ok(Some(_)) => {
                    let _ = events.send(GatewayEvent::SettlementVerified {
                        tx_hash,
                        resource_id,
                    });
                }
                Ok(None) => {
                    let _ = events.send(GatewayEvent::SettlementUnverified {
                        tx_hash,
                        reason: "no matching payment event".to_string(),
                    });
                }
                Err(e) => {
                    warn!("Settlement {tx_hash} for resource {resource_id} unresolved: {e}");
                    let _ = events.send(GatewayEvent::SettlementUnverified {
                        tx_hash,
                        reason: e.to_string(),
                    });
                }
            }
            if reply.send(outcome).is_err() && reserved {
                consumed.release(&tx_hash);
                warn!("Caller for settlement {tx_hash} went away; left it redeemable by its payer");
            }
        });

        let (pending, detail) = match reply_rx.await {
            Ok(Ok(Some(event))) => return Ok(event),
            Ok(Ok(None)) => (false, "no matching payment event".to_string()),
            Ok(Err(e)) => (
                matches!(e, Error::TransientLedger(_) | Error::TransactionNotFound(_)),
                e.to_string(),
            ),
            Err(_) => {
                error!("Verification task for {tx_hash} ended without an outcome");
                (false, "verification task aborted".to_string())
            }
        };
        debug!("Verification of {tx_hash} failed: {detail}");

        let mut rejection = Rejection::from_error(
            GatewayState::Verifying,
            &Error::PaymentNotVerified(tx_hash),
            Some(tx_hash),
        );
        if pending {
            rejection.retriable = true;
            rejection.message = "Payment not confirmed yet".to_string();
        }
        Err(self.reject(rejection))
    }

    fn consume(&self, state: GatewayState, tx_hash: TxHash, resource_id: u64) -> Result<(), Rejection> {
        if self.consumed.try_consume(tx_hash, resource_id) {
            return Ok(());
        }
        warn!("Replay of consumed settlement {tx_hash} for resource {resource_id}");
        Err(self.reject(Rejection::from_error(
            state,
            &Error::SettlementConsumed(tx_hash),
            Some(tx_hash),
        )))
    }

    fn reject(&self, rejection: Rejection) -> Rejection {
        info!(
            "Request rejected in {}: {} ({})",
            rejection.state,
            rejection.reason.code(),
            rejection.message
        );
        let _ = self.events.send(GatewayEvent::RequestRejected {
            state: rejection.state.to_string(),
            reason: rejection.reason.code().to_string(),
        });
        rejection
    }
}
