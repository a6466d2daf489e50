//! HTTP handlers.

use super::{ApiError, SharedState};
use crate::analysis::DEFAULT_MODE;
use crate::auth::{create_signer_message, dataset_message, ensure_signed_by, recover_principal};
use crate::catalog::CatalogEntry;
use crate::config::parse_token_amount;
use crate::error::Error;
use crate::gateway::{AccessRequest, PaymentProof, ResourceTarget};
use alloy::primitives::{Address, TxHash};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Header carrying a payment proof for `/dataset`.
pub const PAYMENT_HEADER: &str = "x-payment";

/// Liveness text.
pub async fn index() -> impl IntoResponse {
    concat!("agentpay-node ", env!("CARGO_PKG_VERSION"), " is running")
}

fn parse_address(field: &str, value: Option<&str>) -> Result<Address, ApiError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("Missing {field}")))?;
    value
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid {field}: {value}")))
}

/// Product ids arrive as numbers or numeric strings.
fn id_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// POST /ai-query body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQueryRequest {
    /// Direct catalog id.
    #[serde(default)]
    pub product_id: Option<Value>,
    /// Free text resolved through the index when no id is given.
    #[serde(default)]
    pub query: Option<String>,
    /// Mode label (legacy name).
    #[serde(default)]
    pub task: Option<String>,
    /// Mode label.
    #[serde(default)]
    pub mode: Option<String>,
    /// Paying principal.
    #[serde(default)]
    pub user_address: Option<String>,
    /// Question for custom research.
    #[serde(default)]
    pub custom_query: Option<String>,
}

/// POST /ai-query response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQueryResponse {
    /// Settlement transaction.
    pub tx_hash: String,
    /// Resolved product.
    pub product_id: u64,
    /// Mode that was run.
    pub mode: String,
    /// Collaborator output.
    pub analysis: String,
}

impl AiQueryRequest {
    fn into_access_request(self) -> Result<AccessRequest, ApiError> {
        let principal = parse_address("userAddress", self.user_address.as_deref())?;

        let target = match (&self.product_id, self.query) {
            (Some(value), _) if !value.is_null() => ResourceTarget::Id(
                id_from_value(value)
                    .ok_or_else(|| ApiError::bad_request(format!("Invalid productId: {value}")))?,
            ),
            (_, Some(query)) if !query.trim().is_empty() => ResourceTarget::Query(query),
            _ => return Err(ApiError::bad_request("Missing productId or query")),
        };

        Ok(AccessRequest {
            principal,
            target,
            mode: self.mode.or(self.task),
            custom_query: self.custom_query,
        })
    }
}

/// POST /ai-query
pub async fn ai_query(
    State(state): State<SharedState>,
    body: Result<Json<AiQueryRequest>, JsonRejection>,
) -> Result<Json<AiQueryResponse>, ApiError> {
    let Json(body) = body?;
    let request = body.into_access_request()?;
    debug!(
        "ai-query from {} for {:?} ({})",
        request.principal,
        request.target,
        request.mode.as_deref().unwrap_or(DEFAULT_MODE)
    );

    let grant = state.gateway.handle(request).await?;
    Ok(Json(AiQueryResponse {
        tx_hash: grant.tx_hash.to_string(),
        product_id: grant.resource_id,
        mode: grant.task.label().to_string(),
        analysis: grant.analysis,
    }))
}

fn invalid_payment_header() -> ApiError {
    ApiError::new(
        StatusCode::PAYMENT_REQUIRED,
        "invalid_payment_header",
        "Invalid payment header",
    )
}

/// Parse `{"txHash", "datasetId", "amount", "signature"}` from the payment header.
///
/// `signature` is the paying principal's signature over
/// [`dataset_message`]; the recovered address becomes the proof's payer.
pub fn parse_payment_header(headers: &HeaderMap) -> Result<PaymentProof, ApiError> {
    let raw = headers
        .get(PAYMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(invalid_payment_header)?;
    let payment: Value = serde_json::from_str(raw).map_err(|_| invalid_payment_header())?;

    let tx_hash: TxHash = payment
        .get("txHash")
        .and_then(Value::as_str)
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(invalid_payment_header)?;
    let resource_id = payment
        .get("datasetId")
        .and_then(id_from_value)
        .ok_or_else(invalid_payment_header)?;
    let claimed_amount = payment.get("amount").map(|amount| match amount {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let signature = payment
        .get("signature")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::from(Error::Unauthorized("missing signature".to_string())))?;
    let payer = recover_principal(&dataset_message(tx_hash, resource_id), signature)?;

    Ok(PaymentProof {
        tx_hash,
        resource_id,
        claimed_amount,
        payer,
    })
}

/// GET /dataset
pub async fn dataset(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<CatalogEntry>, ApiError> {
    let proof = parse_payment_header(&headers).inspect_err(|_| {
        warn!("Rejected dataset request with malformed {PAYMENT_HEADER} header");
    })?;
    let entry = state.gateway.release_dataset(proof).await?;
    Ok(Json(entry))
}

/// GET /search-product query string.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    /// Free text.
    #[serde(default)]
    pub q: Option<String>,
}

/// GET /search-product response.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    /// Query as given.
    pub query: String,
    /// Ranked ids.
    pub ids: Vec<u64>,
}

/// GET /search-product
pub async fn search_product(
    State(state): State<SharedState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Query(params) = params?;
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Err(ApiError::bad_request("Missing query param q"));
    }
    let ids = state.gateway.catalog().search(&query);
    Ok(Json(SearchResponse { query, ids }))
}

/// POST /pick-product body.
#[derive(Debug, Deserialize)]
pub struct PickRequest {
    /// Free text.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// POST /pick-product response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PickResponse {
    /// Best matching product, or the default one.
    pub product_id: u64,
}

/// POST /pick-product
pub async fn pick_product(
    State(state): State<SharedState>,
    body: Result<Json<PickRequest>, JsonRejection>,
) -> Result<Json<PickResponse>, ApiError> {
    let Json(body) = body?;
    let prompt = body
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Prompt required"))?;

    let fallback = state.gateway.policy().default_resource_id;
    let product_id = state
        .gateway
        .catalog()
        .best_match(&prompt, Some(fallback))
        .unwrap_or(fallback);
    Ok(Json(PickResponse { product_id }))
}

/// POST /agent body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentRequest {
    /// Principal to create a signer for.
    #[serde(default)]
    pub user_address: Option<String>,
    /// Daily limit in whole tokens, e.g. `"10"`.
    #[serde(default)]
    pub daily_limit: Option<String>,
    /// Principal's signature over [`create_signer_message`] for the
    /// parsed limit in base units.
    #[serde(default)]
    pub signature: Option<String>,
}

/// POST /agent response.
#[derive(Debug, Serialize)]
pub struct CreateAgentResponse {
    /// New delegated signer.
    pub agent: String,
}

/// POST /agent
pub async fn create_agent(
    State(state): State<SharedState>,
    body: Result<Json<CreateAgentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateAgentResponse>), ApiError> {
    let Json(body) = body?;
    let principal = parse_address("userAddress", body.user_address.as_deref())?;
    let daily_limit = match body.daily_limit.as_deref() {
        Some(limit) => parse_token_amount(limit, state.token_decimals)
            .map_err(|_| ApiError::bad_request(format!("Invalid dailyLimit: {limit}")))?,
        None => state.default_daily_limit,
    };
    let signature = body
        .signature
        .as_deref()
        .ok_or_else(|| ApiError::from(Error::Unauthorized("missing signature".to_string())))?;
    ensure_signed_by(
        principal,
        &create_signer_message(principal, daily_limit),
        signature,
    )
    .inspect_err(|_| warn!("Refused unsigned signer creation for {principal}"))?;

    let agent = state
        .allowance
        .create_delegated_signer(principal, daily_limit)
        .await
        .map_err(|e| match e {
            Error::LedgerRejected(reason) => {
                ApiError::new(StatusCode::CONFLICT, "ledger_rejected", reason)
            }
            other => other.into(),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateAgentResponse {
            agent: agent.to_string(),
        }),
    ))
}

/// GET /agent/:address response. Amounts are in base units.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusResponse {
    /// Delegated signer.
    pub agent: String,
    /// Token balance.
    pub balance: String,
    /// What the signer may still spend today.
    pub remaining_daily_allowance: String,
}

/// GET /agent/:address
pub async fn agent_status(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<Json<AgentStatusResponse>, ApiError> {
    let principal = parse_address("address", Some(&address))?;
    let status = state
        .allowance
        .signer_status(principal)
        .await?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "no_delegated_signer",
                format!("Principal {principal} has no delegated signer"),
            )
        })?;

    Ok(Json(AgentStatusResponse {
        agent: status.signer.to_string(),
        balance: status.balance.to_string(),
        remaining_daily_allowance: status.remaining_daily_allowance.to_string(),
    }))
}
