//! HTTP surface driven through the router without a socket.

use super::{sign, TestHarness, PRICE};
use agentpay::auth::{create_signer_message, dataset_message};
use agentpay::ledger::LedgerFault;
use alloy::primitives::{Address, TxHash, U256};
use alloy::signers::local::PrivateKeySigner;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn dataset_request(key: &PrivateKeySigner, tx_hash: TxHash, dataset_id: u64) -> Request<Body> {
    let signature = sign(key, &dataset_message(tx_hash, dataset_id));
    Request::builder()
        .uri("/dataset")
        .header(
            "x-payment",
            json!({
                "txHash": tx_hash.to_string(),
                "datasetId": dataset_id,
                "amount": "0.001",
                "signature": signature,
            })
            .to_string(),
        )
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_liveness() {
    let harness = TestHarness::setup().await.unwrap();
    let response = harness.router().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_ai_query_without_signer_is_402() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x61);

    let (status, body) = send(
        harness.router(),
        post_json(
            "/ai-query",
            &json!({"productId": 5, "userAddress": principal.to_string()}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["reason"], "no_delegated_signer");
    assert!(body["error"].is_string());
    assert_eq!(harness.analysis().calls(), 0);
}

#[tokio::test]
async fn test_ai_query_validates_input() {
    let harness = TestHarness::setup().await.unwrap();

    let (status, body) = send(harness.router(), post_json("/ai-query", &json!({"productId": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "bad_request");

    let (status, _) = send(
        harness.router(),
        post_json(
            "/ai-query",
            &json!({"productId": 1, "userAddress": "not-an-address"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        harness.router(),
        post_json(
            "/ai-query",
            &json!({
                "productId": 1,
                "userAddress": Address::repeat_byte(0x62).to_string(),
                "mode": "Custom research",
                "customQuery": "  "
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_agent_lifecycle_and_paid_query() {
    let harness = TestHarness::setup().await.unwrap();
    let key = PrivateKeySigner::random();
    let principal = key.address();
    let create = json!({
        "userAddress": principal.to_string(),
        "dailyLimit": "0.005",
        "signature": sign(&key, &create_signer_message(principal, U256::from(5 * PRICE))),
    });

    let (status, body) = send(harness.router(), post_json("/agent", &create)).await;
    assert_eq!(status, StatusCode::CREATED);
    let agent: Address = body["agent"].as_str().unwrap().parse().unwrap();

    let (status, body) = send(harness.router(), post_json("/agent", &create)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "ledger_rejected");

    harness.ledger().fund(agent, U256::from(10 * PRICE));

    let (status, body) = send(harness.router(), get(&format!("/agent/{principal}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], (10 * PRICE).to_string());
    assert_eq!(body["remainingDailyAllowance"], (5 * PRICE).to_string());

    let (status, body) = send(
        harness.router(),
        post_json(
            "/ai-query",
            &json!({"query": "blue mascara", "userAddress": principal.to_string()}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["productId"], 2);
    assert_eq!(body["mode"], "analysis");
    assert_eq!(body["analysis"], "analysis for Blue Mascara");
    let tx_hash = body["txHash"].as_str().unwrap().to_string();

    let (_, body) = send(harness.router(), get(&format!("/agent/{principal}"))).await;
    assert_eq!(body["remainingDailyAllowance"], (4 * PRICE).to_string());

    let tx_hash: TxHash = tx_hash.parse().unwrap();

    // Someone who merely saw the hash.
    let stranger = PrivateKeySigner::random();
    let (status, body) = send(harness.router(), dataset_request(&stranger, tx_hash, 2)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "payer_mismatch");

    // The settlement already paid for the analysis.
    let (status, body) = send(harness.router(), dataset_request(&key, tx_hash, 2)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "settlement_consumed");
}

#[tokio::test]
async fn test_agent_creation_requires_the_principals_signature() {
    let harness = TestHarness::setup().await.unwrap();
    let attacker = PrivateKeySigner::random();
    let victim = Address::repeat_byte(0x65);
    let limit = U256::from(PRICE);

    let (status, body) = send(
        harness.router(),
        post_json(
            "/agent",
            &json!({
                "userAddress": victim.to_string(),
                "dailyLimit": "0.001",
                "signature": sign(&attacker, &create_signer_message(victim, limit)),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["reason"], "unauthorized");

    let (status, _) = send(
        harness.router(),
        post_json("/agent", &json!({"userAddress": victim.to_string(), "dailyLimit": "0.001"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A signature for one limit does not cover another.
    let key = PrivateKeySigner::random();
    let (status, _) = send(
        harness.router(),
        post_json(
            "/agent",
            &json!({
                "userAddress": key.address().to_string(),
                "dailyLimit": "1000",
                "signature": sign(&key, &create_signer_message(key.address(), limit)),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    for principal in [victim, key.address()] {
        let (status, _) = send(harness.router(), get(&format!("/agent/{principal}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_failure_after_payment_reports_the_settlement() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x66);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.analysis().fail();

    let (status, body) = send(
        harness.router(),
        post_json("/ai-query", &json!({"productId": 1, "userAddress": principal.to_string()})),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["reason"], "analysis_failed");
    assert_eq!(body["retriable"], false);
    let tx_hash: TxHash = body["txHash"].as_str().unwrap().parse().unwrap();
    assert_eq!(harness.gateway().consumed().consumed_for(&tx_hash), Some(1));
}

#[tokio::test]
async fn test_unconfirmed_payment_is_retriable_not_repayable() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x67);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.ledger().inject(LedgerFault::DropNextReceipt);

    let (status, body) = send(
        harness.router(),
        post_json("/ai-query", &json!({"productId": 1, "userAddress": principal.to_string()})),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["reason"], "payment_not_verified");
    assert_eq!(body["retriable"], true);
    assert!(body["txHash"].is_string());
    assert_eq!(harness.ledger().payments_submitted(), 1);
}

#[tokio::test]
async fn test_malformed_bodies_get_structured_errors() {
    let harness = TestHarness::setup().await.unwrap();

    let truncated = Request::builder()
        .method("POST")
        .uri("/ai-query")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"productId": 1, "userAdd"#))
        .unwrap();
    let (status, body) = send(harness.router(), truncated).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "bad_request");
    assert!(body["error"].is_string());

    let untyped = Request::builder()
        .method("POST")
        .uri("/pick-product")
        .body(Body::from(r#"{"prompt": "lip"}"#))
        .unwrap();
    let (status, body) = send(harness.router(), untyped).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "bad_request");

    let wrong_type = Request::builder()
        .method("POST")
        .uri("/agent")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"userAddress": 42}"#))
        .unwrap();
    let (status, body) = send(harness.router(), wrong_type).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "bad_request");
}

#[tokio::test]
async fn test_agent_status_errors() {
    let harness = TestHarness::setup().await.unwrap();

    let unknown = Address::repeat_byte(0x64);
    let (status, _) = send(harness.router(), get(&format!("/agent/{unknown}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(harness.router(), get("/agent/0x1234")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_dataset_requires_valid_header() {
    let harness = TestHarness::setup().await.unwrap();

    let (status, body) = send(harness.router(), get("/dataset")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "Invalid payment header");

    let garbage = Request::builder()
        .uri("/dataset")
        .header("x-payment", "{not json")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(harness.router(), garbage).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let unsigned = Request::builder()
        .uri("/dataset")
        .header(
            "x-payment",
            json!({"txHash": TxHash::repeat_byte(1).to_string(), "datasetId": 1}).to_string(),
        )
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(harness.router(), unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["reason"], "unauthorized");
}

#[tokio::test]
async fn test_search_and_pick_product() {
    let harness = TestHarness::setup().await.unwrap();

    let (status, body) = send(harness.router(), get("/search-product?q=lip")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"query": "lip", "ids": [1]}));

    let (status, _) = send(harness.router(), get("/search-product?q=%20")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        harness.router(),
        post_json("/pick-product", &json!({"prompt": "something floral"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["productId"], 5);

    let (_, body) = send(
        harness.router(),
        post_json("/pick-product", &json!({"prompt": "qqqq"})),
    )
    .await;
    assert_eq!(body["productId"], 1);

    let (status, _) = send(harness.router(), post_json("/pick-product", &json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
