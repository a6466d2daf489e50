//! HTTP surface.
//!
//! Provides:
//! - Paid analysis (`POST /ai-query`) and dataset release (`GET /dataset`)
//! - Catalog lookups (`GET /search-product`, `POST /pick-product`)
//! - Delegated signer management (`POST /agent`, `GET /agent/:address`)

mod routes;

use crate::allowance::AllowanceClient;
use crate::error::{Error, Result};
use crate::gateway::{AccessGateway, GatewayState, RejectReason, Rejection};
use alloy::primitives::{TxHash, U256};
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// State shared across handlers.
pub struct AppState {
    /// Request state machine.
    pub gateway: Arc<AccessGateway>,
    /// Delegated signer reads and creation.
    pub allowance: AllowanceClient,
    /// Token decimals for caller-supplied amounts.
    pub token_decimals: u8,
    /// Daily limit for new signers when the caller gives none.
    pub default_daily_limit: U256,
}

/// Shared handler state.
pub type SharedState = Arc<AppState>;

/// Create the HTTP router.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/ai-query", post(routes::ai_query))
        .route("/dataset", get(routes::dataset))
        .route("/search-product", get(routes::search_product))
        .route("/pick-product", post(routes::pick_product))
        .route("/agent", post(routes::create_agent))
        .route("/agent/:address", get(routes::agent_status))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns `Server` if the accept loop fails.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on {addr}");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Server(e.to_string()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    reason: &'static str,
    /// Settlement the request already paid with. Keep it: it is how the
    /// payment is reconciled or redeemed later.
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_hash: Option<String>,
    /// Retry the check, not the payment.
    retriable: bool,
}

/// Error response with a `{error, reason, txHash?, retriable}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
    message: String,
    tx_hash: Option<TxHash>,
    retriable: bool,
}

impl ApiError {
    /// Error with an explicit status and reason code.
    #[must_use]
    pub fn new(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: message.into(),
            tx_hash: None,
            retriable: false,
        }
    }

    /// 400 with a `bad_request` reason.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, RejectReason::BadRequest.code(), message)
    }

    /// HTTP status of this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        let status = StatusCode::from_u16(rejection.reason.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            tx_hash: rejection.tx_hash,
            retriable: rejection.retriable,
            ..Self::new(status, rejection.reason.code(), rejection.message)
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Rejection::from_error(GatewayState::Resolving, &err, None).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            reason: self.reason,
            tx_hash: self.tx_hash.map(|tx| tx.to_string()),
            retriable: self.retriable,
        };
        (self.status, Json(body)).into_response()
    }
}
