// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests covering the webhook ingress path end to end through
//! the REST surface, including HMAC signature verification and delivery
//! dedup, plus the event classifier against raw Matrix timeline shapes.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Utc;
use serde_json::json;

use agent_bridge::arbiter::DeliveryArbiter;
use agent_bridge::config::WebhookVerifyMode;
use agent_bridge::gateway::{ClientPool, HomeserverGateway};
use agent_bridge::health::HealthTracker;
use agent_bridge::identity::store::IdentityStore;
use agent_bridge::peer::PeerRegistry;
use agent_bridge::rest;
use agent_bridge::router::{classify, ClassificationOutcome, DropReason, IncomingEvent, RoomOwnerLookup};
use agent_bridge::storage::Db;
use agent_bridge::webhook::WebhookIngress;
use agent_bridge::BridgeState;

const WEBHOOK_SECRET: &str = "integration-test-secret";

fn test_state(verify_mode: WebhookVerifyMode) -> Arc<BridgeState> {
    let db = Arc::new(Db::open_in_memory().expect("open db"));
    let gateway = HomeserverGateway::new("http://localhost:0").expect("build gateway");
    let pool = Arc::new(ClientPool::new(gateway.clone()));
    let arbiter = Arc::new(DeliveryArbiter::new(Duration::from_secs(300)));
    let peers = Arc::new(PeerRegistry::new(Duration::from_secs(300)));
    let health = Arc::new(HealthTracker::new());
    let webhook = Arc::new(WebhookIngress::new(
        Arc::clone(&db),
        gateway.clone(),
        Arc::clone(&pool),
        Arc::clone(&arbiter),
        verify_mode,
        Some(WEBHOOK_SECRET.to_owned()),
        Arc::clone(&health),
    ));
    Arc::new(BridgeState { db, gateway, pool, arbiter, peers, webhook, health, admin_bearer_token: None })
}

fn test_server(state: Arc<BridgeState>) -> TestServer {
    TestServer::new(rest::build_router(state)).expect("build test server")
}

fn sign(body: &[u8]) -> String {
    let now = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    let t = now.as_secs();
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, WEBHOOK_SECRET.as_bytes());
    let mut signed = format!("{t}.").into_bytes();
    signed.extend_from_slice(body);
    let tag = ring::hmac::sign(&key, &signed);
    format!("t={t},v1={}", hex::encode(tag.as_ref()))
}

#[tokio::test]
async fn webhook_rejects_missing_signature_when_enforced() {
    let server = test_server(test_state(WebhookVerifyMode::Enforce));
    let response = server
        .post("/webhooks/agent-response")
        .json(&json!({ "agent_id": "agent-meridian", "run_id": "run-1", "messages": [] }))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_rejects_tampered_signature() {
    let server = test_server(test_state(WebhookVerifyMode::Enforce));
    let body = json!({ "agent_id": "agent-meridian", "run_id": "run-1", "messages": [] });
    let bad_signature = sign(b"not the real body");
    let response = server
        .post("/webhooks/agent-response")
        .add_header("x-bridge-signature", bad_signature)
        .json(&body)
        .await;
    response.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn webhook_rejects_missing_agent_or_run_id() {
    let server = test_server(test_state(WebhookVerifyMode::Bypass));
    let response = server
        .post("/webhooks/agent-response")
        .json(&json!({ "agent_id": "", "run_id": "", "messages": [] }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_with_no_assistant_message_is_a_no_op() {
    let server = test_server(test_state(WebhookVerifyMode::Bypass));
    let response = server
        .post("/webhooks/agent-response")
        .json(&json!({
            "agent_id": "agent-meridian",
            "run_id": "run-1",
            "messages": [{"role": "user", "content": "hello"}],
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["posted"], false);
}

#[tokio::test]
async fn webhook_for_unknown_agent_does_not_claim_the_dedup_key() {
    let server = test_server(test_state(WebhookVerifyMode::Bypass));
    let payload = json!({
        "agent_id": "agent-nobody",
        "run_id": "run-1",
        "messages": [{"role": "assistant", "content": "hi there"}],
    });

    let first = server.post("/webhooks/agent-response").json(&payload).await;
    first.assert_status(StatusCode::NOT_FOUND);

    // Same (agent_id, run_id): the first attempt never reached a successful
    // post, so nothing was recorded in seen_runs and the runtime's retry is
    // given a genuine re-attempt rather than being silently deduped.
    let second = server.post("/webhooks/agent-response").json(&payload).await;
    second.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_retry_after_a_downstream_send_failure_is_deduped_by_the_arbiter_not_seen_runs() {
    let state = test_state(WebhookVerifyMode::Bypass);
    {
        let store = IdentityStore::new(&state.db);
        store
            .upsert("agent-1", "Meridian", Some("@agent_1:example.org"), Some("!room:example.org"))
            .expect("upsert");
        store.bind_room("agent-1", "!room:example.org").expect("bind");
    }
    let server = test_server(state);
    let payload = json!({
        "agent_id": "agent-1",
        "run_id": "run-1",
        "messages": [{"role": "assistant", "content": "hi there"}],
    });

    // The gateway points at an unreachable homeserver, so the send itself
    // fails downstream of the identity lookup; seen_runs must not have
    // claimed the key on this failure.
    let first = server.post("/webhooks/agent-response").json(&payload).await;
    assert!(!first.status_code().is_success());

    // The retry reaches the same code path again (seen_runs didn't block
    // it), but the Delivery Arbiter's own claim for this (agent_id, run_id)
    // is already Failed from the first attempt, so it dedupes there instead
    // - a 200 no-op rather than a second downstream attempt or a dropped
    // retry.
    let second = server.post("/webhooks/agent-response").json(&payload).await;
    second.assert_status_ok();
    let body: serde_json::Value = second.json();
    assert_eq!(body["posted"], false);
}

#[tokio::test]
async fn webhook_accepts_a_validly_signed_request() {
    let server = test_server(test_state(WebhookVerifyMode::Enforce));
    let payload = json!({
        "agent_id": "agent-nobody",
        "run_id": "run-1",
        "messages": [{"role": "user", "content": "hello"}],
    });
    // Sign over exactly the bytes the JSON extractor will see on the wire.
    let raw = serde_json::to_vec(&payload).expect("serialize body");
    let signature_header = sign(&raw);

    let response = server
        .post("/webhooks/agent-response")
        .add_header("x-bridge-signature", signature_header)
        .json(&payload)
        .await;
    // No assistant message to extract, but the signature itself was valid.
    response.assert_status_ok();
}

// -- Event classifier -----------------------------------------------------

struct StaticLookup(Option<(String, String)>);

impl RoomOwnerLookup for StaticLookup {
    fn owning_agent(&self, _room_id: &str) -> Option<(String, String)> {
        self.0.clone()
    }
}

fn message_event(room_id: &str, sender: &str, body: &str, bridge_originated: bool) -> serde_json::Value {
    let mut content = json!({ "msgtype": "m.text", "body": body });
    if bridge_originated {
        content["bridge_originated"] = json!(true);
    }
    json!({
        "event_id": "$evt1",
        "type": "m.room.message",
        "room_id": room_id,
        "sender": sender,
        "origin_ts": Utc::now().timestamp_millis(),
        "content": content,
    })
}

#[test]
fn classifier_forwards_a_human_authored_message_to_the_rooms_owning_agent() {
    let lookup = StaticLookup(Some(("agent-meridian".to_owned(), "@agent_meridian:example.org".to_owned())));
    let raw = message_event("!room:example.org", "@human:example.org", "hi", false);
    let event = IncomingEvent::from_raw(&raw);
    let watermark = Utc::now() - chrono::Duration::hours(1);
    let outcome = classify(&event, watermark, &lookup);
    assert!(matches!(outcome, ClassificationOutcome::ForwardToRuntime { owning_agent_id } if owning_agent_id == "agent-meridian"));
}

#[test]
fn classifier_drops_events_carrying_the_bridge_originated_marker() {
    // Sender is a different agent's mxid than the room's owner, so this
    // isn't a self-echo - only the loop marker should trip the drop.
    let lookup = StaticLookup(Some(("agent-meridian".to_owned(), "@agent_meridian:example.org".to_owned())));
    let raw = message_event("!room:example.org", "@agent_other:example.org", "echo", true);
    let event = IncomingEvent::from_raw(&raw);
    let watermark = Utc::now() - chrono::Duration::hours(1);
    let outcome = classify(&event, watermark, &lookup);
    assert!(matches!(outcome, ClassificationOutcome::Drop(DropReason::LoopMarker)));
}

#[test]
fn classifier_drops_events_with_no_owning_room() {
    let lookup = StaticLookup(None);
    let raw = message_event("!orphan:example.org", "@human:example.org", "hi", false);
    let event = IncomingEvent::from_raw(&raw);
    let watermark = Utc::now() - chrono::Duration::hours(1);
    let outcome = classify(&event, watermark, &lookup);
    assert!(matches!(outcome, ClassificationOutcome::Drop(DropReason::NoOwningRoom)));
}

#[test]
fn classifier_drops_events_before_the_cold_start_watermark() {
    let lookup = StaticLookup(Some(("agent-meridian".to_owned(), "@agent_meridian:example.org".to_owned())));
    let raw = message_event("!room:example.org", "@human:example.org", "old message", false);
    let event = IncomingEvent::from_raw(&raw);
    let watermark = Utc::now() + chrono::Duration::hours(1);
    let outcome = classify(&event, watermark, &lookup);
    assert!(matches!(outcome, ClassificationOutcome::Drop(DropReason::BeforeColdStartWatermark)));
}
