// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External Interface Layer: the REST surface the bridge exposes over HTTP.

pub mod auth;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::BridgeError;
use crate::identity::store::IdentityStore;
use crate::tool::{self, ToolContext};
use crate::webhook::WebhookPayload;
use crate::BridgeState;

pub fn build_router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents/mappings", get(agent_mappings))
        .route("/agents/{agent_id}/room", get(agent_room))
        .route("/webhooks/agent-response", post(webhook_agent_response))
        .route("/conversations/register", post(register_conversation))
        .route("/tool", post(tool_dispatch))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(state.health.snapshot())
}

async fn agent_mappings(State(state): State<Arc<BridgeState>>) -> Result<impl IntoResponse, BridgeError> {
    let store = IdentityStore::new(&state.db);
    let mappings: Vec<_> = store
        .export_snapshot()?
        .into_iter()
        .map(|identity| {
            json!({
                "agent_id": identity.agent_id,
                "mxid": identity.mxid,
                "room_id": identity.room_id,
                "name": identity.agent_name,
            })
        })
        .collect();
    Ok(Json(json!({ "agents": mappings })))
}

async fn agent_room(
    State(state): State<Arc<BridgeState>>,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, BridgeError> {
    let store = IdentityStore::new(&state.db);
    let identity = store
        .get_by_agent_id(&agent_id)?
        .ok_or_else(|| BridgeError::NotFound { detail: format!("unknown agent_id {agent_id}") })?;
    let room_id = identity
        .room_id
        .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;
    Ok(Json(json!({ "agent_id": agent_id, "room_id": room_id })))
}

async fn webhook_agent_response(
    State(state): State<Arc<BridgeState>>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, BridgeError> {
    let signature_header = headers.get("x-bridge-signature").and_then(|v| v.to_str().ok());
    state.webhook.verify_signature(signature_header, &body)?;

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| BridgeError::MalformedInput { detail: format!("invalid webhook payload: {e}") })?;

    let sent = state.webhook.handle(payload).await?;
    Ok(Json(json!({ "posted": sent })))
}

#[derive(serde::Deserialize)]
struct RegisterConversationRequest {
    room_id: String,
    agent_id: String,
    conversation_id: String,
    #[serde(default)]
    user_scope: Option<String>,
}

async fn register_conversation(
    State(state): State<Arc<BridgeState>>,
    Json(req): Json<RegisterConversationRequest>,
) -> Result<impl IntoResponse, BridgeError> {
    let now = chrono::Utc::now().to_rfc3339();
    let user_scope = req.user_scope.unwrap_or_default();
    state.db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO conversation_bindings (conversation_id, room_id, agent_id, user_scope, created_at, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(room_id, agent_id, user_scope) DO NOTHING",
            rusqlite::params![req.conversation_id, req.room_id, req.agent_id, user_scope, now],
        )?;
        Ok(())
    })?;
    Ok(Json(json!({ "ok": true })))
}

/// Thin REST façade over the Unified Tool Surface's operation-dispatched
/// tool: `{"operation": "...", "params": {...}}` in, the operation's JSON
/// result out.
#[derive(serde::Deserialize)]
struct ToolRequest {
    operation: String,
    #[serde(default)]
    params: serde_json::Value,
}

async fn tool_dispatch(
    State(state): State<Arc<BridgeState>>,
    Json(req): Json<ToolRequest>,
) -> Result<impl IntoResponse, BridgeError> {
    let ctx = ToolContext {
        db: Arc::clone(&state.db),
        gateway: state.gateway.clone(),
        pool: Arc::clone(&state.pool),
        arbiter: Arc::clone(&state.arbiter),
        peers: Arc::clone(&state.peers),
    };
    let result = tool::dispatch(&ctx, &req.operation, req.params).await?;
    Ok(Json(result))
}
