//! Access gateway scenarios against the in-memory chain.

use super::{TestHarness, PRICE};
use agentpay::event::GatewayEvent;
use agentpay::gateway::{AccessRequest, GatewayState, PaymentProof, RejectReason, ResourceTarget};
use agentpay::ledger::{Ledger, LedgerFault, PaymentCall};
use alloy::primitives::{Address, TxHash, B256, U256};
use std::sync::Arc;
use std::time::Duration;

fn by_id(principal: Address, id: u64) -> AccessRequest {
    AccessRequest {
        principal,
        target: ResourceTarget::Id(id),
        mode: None,
        custom_query: None,
    }
}

fn drain(events: &mut agentpay::event::GatewayEventsChannel) -> Vec<GatewayEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_no_signer_is_rejected_before_any_spend() {
    let harness = TestHarness::setup().await.unwrap();
    let mut events = harness.events();

    let rejection = harness
        .gateway()
        .handle(by_id(Address::repeat_byte(0x51), 5))
        .await
        .unwrap_err();

    assert_eq!(rejection.state, GatewayState::Paying);
    assert_eq!(rejection.reason, RejectReason::NoDelegatedSigner);
    assert_eq!(rejection.reason.status(), 402);
    assert!(rejection.tx_hash.is_none());
    assert_eq!(harness.ledger().payments_submitted(), 0);
    assert_eq!(harness.analysis().calls(), 0);

    let seen = drain(&mut events);
    assert!(!seen.iter().any(|e| matches!(
        e,
        GatewayEvent::SettlementVerified { .. } | GatewayEvent::SettlementUnverified { .. }
    )));
}

#[tokio::test]
async fn test_paid_request_releases_analysis() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x52);
    let signer = harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    let mut events = harness.events();

    let mut request = by_id(principal, 3);
    request.mode = Some("Analyze profitability".to_string());
    let grant = harness.gateway().handle(request).await.unwrap();

    assert_eq!(grant.resource_id, 3);
    assert_eq!(grant.task.label(), "Analyze profitability");
    assert_eq!(grant.analysis, "Analyze profitability for Smartphone X");
    assert_eq!(harness.analysis().calls(), 1);
    assert_eq!(
        harness.ledger().token_balance(signer).await.unwrap(),
        U256::from(9 * PRICE)
    );

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(
        e,
        GatewayEvent::SettlementBroadcast { tx_hash, .. } if *tx_hash == grant.tx_hash
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        GatewayEvent::SettlementVerified { resource_id: 3, .. }
    )));
    assert!(seen
        .iter()
        .any(|e| matches!(e, GatewayEvent::AccessGranted { resource_id: 3, .. })));
}

#[tokio::test]
async fn test_reverted_payment_is_never_dispatched() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x53);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.ledger().inject(LedgerFault::RevertNextPayment);

    let rejection = harness.gateway().handle(by_id(principal, 1)).await.unwrap_err();

    assert_eq!(rejection.state, GatewayState::Verifying);
    assert_eq!(rejection.reason, RejectReason::PaymentNotVerified);
    assert!(rejection.tx_hash.is_some());
    assert_eq!(harness.analysis().calls(), 0);
}

#[tokio::test]
async fn test_underpaid_event_is_not_verified() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x54);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.ledger().inject(LedgerFault::UnderreportNextPayment {
        amount: U256::from(PRICE - 1),
    });

    let rejection = harness.gateway().handle(by_id(principal, 1)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::PaymentNotVerified);
    assert_eq!(harness.analysis().calls(), 0);
}

#[tokio::test]
async fn test_misattributed_event_is_not_verified() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x55);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness
        .ledger()
        .inject(LedgerFault::MisattributeNextPayment { resource_id: 4 });

    let rejection = harness.gateway().handle(by_id(principal, 1)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::PaymentNotVerified);
    assert_eq!(harness.analysis().calls(), 0);
}

#[tokio::test]
async fn test_broadcast_failure_is_unavailable() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x56);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.ledger().inject(LedgerFault::FailNextBroadcast);

    let rejection = harness.gateway().handle(by_id(principal, 1)).await.unwrap_err();
    assert_eq!(rejection.state, GatewayState::Paying);
    assert_eq!(rejection.reason, RejectReason::LedgerUnavailable);
    assert_eq!(rejection.reason.status(), 503);
}

#[tokio::test]
async fn test_exhausted_allowance_is_payment_rejected() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x57);
    harness.onboard(principal, PRICE, 10 * PRICE).await.unwrap();

    harness.gateway().handle(by_id(principal, 1)).await.unwrap();
    let rejection = harness.gateway().handle(by_id(principal, 1)).await.unwrap_err();

    assert_eq!(rejection.reason, RejectReason::PaymentRejected);
    assert_eq!(harness.ledger().payments_submitted(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_respect_allowance() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x58);
    let signer = harness.onboard(principal, 3 * PRICE, 100 * PRICE).await.unwrap();
    let gateway = Arc::clone(harness.gateway());

    let attempts = (0..6).map(|_| {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.handle(by_id(principal, 2)).await })
    });
    let results = futures::future::join_all(attempts).await;

    let granted = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(rej)) if rej.reason == RejectReason::PaymentRejected))
        .count();
    assert_eq!(granted, 3);
    assert_eq!(refused, 3);

    let ledger = harness.ledger();
    assert_eq!(ledger.remaining_daily_allowance(signer).await.unwrap(), U256::ZERO);
    assert_eq!(ledger.token_balance(signer).await.unwrap(), U256::from(97 * PRICE));
}

#[tokio::test]
async fn test_analysis_failure_still_consumes_settlement() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x59);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.analysis().fail();

    let rejection = harness.gateway().handle(by_id(principal, 1)).await.unwrap_err();
    assert_eq!(rejection.state, GatewayState::Dispatching);
    assert_eq!(rejection.reason, RejectReason::AnalysisFailed);

    let tx = rejection.tx_hash.unwrap();
    assert_eq!(harness.gateway().consumed().consumed_for(&tx), Some(1));
}

#[tokio::test]
async fn test_settlement_releases_dataset_once() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x5a);
    let signer = harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();

    let ledger = harness.ledger();
    let contract = ledger.addresses().ledger_contract;
    ledger
        .approve_from_signer(signer, contract, U256::from(10 * PRICE))
        .await
        .unwrap();
    let call = PaymentCall {
        resource_id: 4,
        task: "dataset".to_string(),
        receipt_id: B256::repeat_byte(9),
    };
    let tx_hash = ledger
        .pay_from_signer(signer, &call, U256::from(PRICE))
        .await
        .unwrap();

    let proof = PaymentProof {
        tx_hash,
        resource_id: 4,
        claimed_amount: Some("0.001".to_string()),
        payer: principal,
    };
    let entry = harness.gateway().release_dataset(proof.clone()).await.unwrap();
    assert_eq!(entry.title, "Laptop Stand");

    let replay = harness.gateway().release_dataset(proof).await.unwrap_err();
    assert_eq!(replay.reason, RejectReason::SettlementConsumed);
    assert_eq!(replay.reason.status(), 409);
    assert_eq!(harness.gateway().consumed().stats().replays_rejected, 1);
}

#[tokio::test]
async fn test_dataset_proof_for_other_resource_is_refused() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x5b);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.analysis().fail();

    // Paid for resource 1; the settlement is consumed by the failed dispatch.
    let rejection = harness.gateway().handle(by_id(principal, 1)).await.unwrap_err();
    let tx_hash = rejection.tx_hash.unwrap();

    let wrong = harness
        .gateway()
        .release_dataset(PaymentProof {
            tx_hash,
            resource_id: 2,
            claimed_amount: None,
            payer: principal,
        })
        .await
        .unwrap_err();
    assert_eq!(wrong.reason, RejectReason::PaymentNotVerified);
}

#[tokio::test]
async fn test_dropped_caller_still_resolves_settlement() {
    let harness = TestHarness::setup().await.unwrap();
    let principal = Address::repeat_byte(0x5c);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.ledger().inject(LedgerFault::DropNextReceipt);
    let mut events = harness.events();

    // The hidden receipt keeps verification waiting past the caller's patience.
    let gave_up = tokio::time::timeout(
        Duration::from_millis(200),
        harness.gateway().handle(by_id(principal, 1)),
    )
    .await;
    assert!(gave_up.is_err());

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let GatewayEvent::SettlementUnverified { tx_hash, .. } = events.recv().await.unwrap() {
                return tx_hash;
            }
        }
    })
    .await
    .unwrap();
    wait_until_redeemable(&harness, outcome).await;
    assert_eq!(harness.analysis().calls(), 0);
}

async fn wait_until_redeemable(harness: &TestHarness, tx_hash: TxHash) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.gateway().consumed().consumed_for(&tx_hash).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn next_broadcast(events: &mut agentpay::event::GatewayEventsChannel) -> TxHash {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let GatewayEvent::SettlementBroadcast { tx_hash, .. } = events.recv().await.unwrap() {
                return tx_hash;
            }
        }
    })
    .await
    .unwrap()
}

fn two_confirmations() -> agentpay::GatewayConfig {
    let mut config = TestHarness::default_config();
    config.ledger.confirmations = 2;
    config.ledger.confirmation_timeout_secs = 5;
    config
}

#[tokio::test]
async fn test_broadcast_settlement_cannot_be_redeemed_by_anyone_else() {
    let harness = TestHarness::setup_with_config(two_confirmations()).await.unwrap();
    let principal = Address::repeat_byte(0x5d);
    let stranger = Address::repeat_byte(0x5e);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    harness.onboard(stranger, 10 * PRICE, 10 * PRICE).await.unwrap();
    let mut events = harness.events();

    let gateway = Arc::clone(harness.gateway());
    let paying = tokio::spawn(async move { gateway.handle(by_id(principal, 1)).await });

    // The hash is public once broadcast; the second confirmation is not in yet.
    let tx_hash = next_broadcast(&mut events).await;
    harness.ledger().mine_blocks(1);

    let proof = |payer| PaymentProof {
        tx_hash,
        resource_id: 1,
        claimed_amount: None,
        payer,
    };
    let stolen = harness.gateway().release_dataset(proof(stranger)).await.unwrap_err();
    assert_eq!(stolen.reason, RejectReason::PayerMismatch);
    let doubled = harness.gateway().release_dataset(proof(principal)).await.unwrap_err();
    assert_eq!(doubled.reason, RejectReason::SettlementConsumed);

    let grant = paying.await.unwrap().unwrap();
    assert_eq!(grant.tx_hash, tx_hash);
    assert_eq!(grant.analysis, "analysis for Red Lipstick");
    assert_eq!(harness.analysis().calls(), 1);
}

#[tokio::test]
async fn test_abandoned_settlement_is_left_to_its_payer() {
    let harness = TestHarness::setup_with_config(two_confirmations()).await.unwrap();
    let principal = Address::repeat_byte(0x5f);
    harness.onboard(principal, 10 * PRICE, 10 * PRICE).await.unwrap();
    let mut events = harness.events();

    let gave_up = tokio::time::timeout(
        Duration::from_millis(100),
        harness.gateway().handle(by_id(principal, 4)),
    )
    .await;
    assert!(gave_up.is_err());

    let tx_hash = next_broadcast(&mut events).await;
    harness.ledger().mine_blocks(1);
    wait_until_redeemable(&harness, tx_hash).await;

    let entry = harness
        .gateway()
        .release_dataset(PaymentProof {
            tx_hash,
            resource_id: 4,
            claimed_amount: None,
            payer: principal,
        })
        .await
        .unwrap();
    assert_eq!(entry.title, "Laptop Stand");
    assert_eq!(harness.analysis().calls(), 0);
}
