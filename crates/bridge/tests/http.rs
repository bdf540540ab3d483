// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the bridge's REST surface.
//!
//! Uses `axum_test::TestServer` - no real TCP or homeserver needed, since
//! none of these routes reach the Homeserver Gateway over the network.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;

use agent_bridge::arbiter::DeliveryArbiter;
use agent_bridge::config::WebhookVerifyMode;
use agent_bridge::gateway::{ClientPool, HomeserverGateway};
use agent_bridge::health::HealthTracker;
use agent_bridge::identity::store::IdentityStore;
use agent_bridge::peer::PeerRegistry;
use agent_bridge::rest;
use agent_bridge::storage::Db;
use agent_bridge::webhook::WebhookIngress;
use agent_bridge::BridgeState;

fn test_state(admin_bearer_token: Option<String>) -> Arc<BridgeState> {
    let db = Arc::new(Db::open_in_memory().expect("open db"));
    let gateway = HomeserverGateway::new("http://localhost:0").expect("build gateway");
    let pool = Arc::new(ClientPool::new(gateway.clone()));
    let arbiter = Arc::new(DeliveryArbiter::new(std::time::Duration::from_secs(300)));
    let peers = Arc::new(PeerRegistry::new(std::time::Duration::from_secs(300)));
    let health = Arc::new(HealthTracker::new());
    let webhook = Arc::new(WebhookIngress::new(
        Arc::clone(&db),
        gateway.clone(),
        Arc::clone(&pool),
        Arc::clone(&arbiter),
        WebhookVerifyMode::Bypass,
        None,
        Arc::clone(&health),
    ));
    Arc::new(BridgeState { db, gateway, pool, arbiter, peers, webhook, health, admin_bearer_token })
}

fn test_server(state: Arc<BridgeState>) -> TestServer {
    TestServer::new(rest::build_router(state)).expect("build test server")
}

#[tokio::test]
async fn health_reports_healthy_with_no_failures() {
    let server = test_server(test_state(None));
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["provisioning_failures"], 0);
}

#[tokio::test]
async fn health_is_reachable_without_a_bearer_token() {
    let server = test_server(test_state(Some("secret-token".to_owned())));
    let response = server.get("/health").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn agent_mappings_is_empty_for_a_fresh_bridge() {
    let server = test_server(test_state(None));
    let response = server.get("/agents/mappings").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["agents"].as_array().expect("array").len(), 0);
}

#[tokio::test]
async fn agent_mappings_includes_seeded_identities() {
    let state = test_state(None);
    {
        let store = IdentityStore::new(&state.db);
        store
            .upsert("agent-meridian", "Meridian", Some("@agent_meridian:example.org"), Some("!room:example.org"))
            .expect("seed identity");
    }
    let server = test_server(state);
    let response = server.get("/agents/mappings").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let agents = body["agents"].as_array().expect("array");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], "agent-meridian");
    assert_eq!(agents[0]["room_id"], "!room:example.org");
}

#[tokio::test]
async fn agent_room_returns_404_for_unknown_agent() {
    let server = test_server(test_state(None));
    let response = server.get("/agents/agent-nobody/room").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn agent_room_returns_bound_room_for_known_agent() {
    let state = test_state(None);
    {
        let store = IdentityStore::new(&state.db);
        store
            .upsert("agent-meridian", "Meridian", Some("@agent_meridian:example.org"), Some("!room:example.org"))
            .expect("seed identity");
    }
    let server = test_server(state);
    let response = server.get("/agents/agent-meridian/room").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["room_id"], "!room:example.org");
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token_when_configured() {
    let server = test_server(test_state(Some("secret-token".to_owned())));
    let response = server.get("/agents/mappings").await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_routes_accept_the_configured_bearer_token() {
    let server = test_server(test_state(Some("secret-token".to_owned())));
    let response =
        server.get("/agents/mappings").add_header("authorization", "Bearer secret-token").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn register_conversation_converges_on_repeated_calls_for_the_same_tuple() {
    let state = test_state(None);
    let server = test_server(Arc::clone(&state));
    let body = json!({
        "room_id": "!room:example.org",
        "agent_id": "agent-meridian",
        "conversation_id": "conv-1",
    });

    let first = server.post("/conversations/register").json(&body).await;
    first.assert_status_ok();

    let mut second_body = body.clone();
    second_body["conversation_id"] = json!("conv-2");
    let second = server.post("/conversations/register").json(&second_body).await;
    second.assert_status_ok();

    // Same (room_id, agent_id, user_scope) tuple: the second registration is
    // a no-op, so the first writer's conversation_id sticks.
    let count: i64 = state
        .db
        .with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM conversation_bindings WHERE room_id = ?1 AND agent_id = ?2",
                rusqlite::params!["!room:example.org", "agent-meridian"],
                |row| row.get(0),
            )
        })
        .expect("count rows");
    assert_eq!(count, 1);

    let winner: String = state
        .db
        .with_conn(|conn| {
            conn.query_row(
                "SELECT conversation_id FROM conversation_bindings WHERE room_id = ?1 AND agent_id = ?2",
                rusqlite::params!["!room:example.org", "agent-meridian"],
                |row| row.get(0),
            )
        })
        .expect("fetch winner");
    assert_eq!(winner, "conv-1");
}

#[tokio::test]
async fn tool_dispatch_derives_a_stable_localpart() {
    let server = test_server(test_state(None));
    let response = server
        .post("/tool")
        .json(&json!({ "operation": "identity_derive", "params": { "agent_id": "agent-meridian" } }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["localpart"], "agent_meridian");
}

#[tokio::test]
async fn tool_dispatch_rejects_unknown_operations() {
    let server = test_server(test_state(None));
    let response = server.post("/tool").json(&json!({ "operation": "not_a_real_op", "params": {} })).await;
    response.assert_status(StatusCode::BAD_REQUEST);
}
