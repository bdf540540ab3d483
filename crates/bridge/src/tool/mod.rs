// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified Tool Surface: a single operation-dispatched tool whose argument
//! object carries an `operation` tag plus that operation's parameters.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::arbiter::{ClaimOutcome, DeliveryArbiter};
use crate::error::BridgeError;
use crate::gateway::{ClientPool, HomeserverGateway};
use crate::identity::store::IdentityStore;
use crate::identity::derive_localpart;
use crate::peer::{PeerRegistration, PeerRegistry};
use crate::storage::Db;

pub const KNOWN_OPERATIONS: &[&str] = &[
    "send", "read", "react", "edit", "typing", "room_join", "room_leave", "room_info", "room_list",
    "room_create", "room_invite", "identity_get", "identity_list", "identity_create", "identity_derive",
    "agent_lookup", "agent_list", "agent_chat", "agent_identity", "subscribe", "unsubscribe",
];

/// Everything a tool-surface dispatch needs to satisfy a request.
pub struct ToolContext {
    pub db: Arc<Db>,
    pub gateway: HomeserverGateway,
    pub pool: Arc<ClientPool>,
    pub arbiter: Arc<DeliveryArbiter>,
    pub peers: Arc<PeerRegistry>,
}

/// Dispatch one tool-surface request. Unknown operations return a
/// structured error enumerating the valid set rather than a generic 404.
pub async fn dispatch(ctx: &ToolContext, operation: &str, params: Value) -> Result<Value, BridgeError> {
    match operation {
        "send" => op_send(ctx, params).await,
        "read" => op_read(ctx, params).await,
        "react" => op_react(ctx, params).await,
        "edit" => op_edit(ctx, params).await,
        "typing" => op_typing(ctx, params).await,
        "room_join" => op_room_join(ctx, params).await,
        "room_leave" => op_room_leave(ctx, params).await,
        "room_info" => op_room_info(ctx, params).await,
        "room_list" => op_room_list(ctx, params).await,
        "room_create" => op_room_create(ctx, params).await,
        "room_invite" => op_room_invite(ctx, params).await,
        "identity_get" => op_identity_get(ctx, params).await,
        "identity_list" => op_identity_list(ctx, params).await,
        "identity_create" => op_identity_create(ctx, params).await,
        "identity_derive" => op_identity_derive(params),
        "agent_lookup" => op_identity_get(ctx, params).await,
        "agent_list" => op_identity_list(ctx, params).await,
        "agent_chat" => op_send(ctx, params).await,
        "agent_identity" => op_identity_get(ctx, params).await,
        "subscribe" => op_subscribe(ctx, params).await,
        "unsubscribe" => op_unsubscribe(ctx, params).await,
        other => Err(BridgeError::MalformedInput {
            detail: format!("unknown operation '{other}', valid operations: {}", KNOWN_OPERATIONS.join(", ")),
        }),
    }
}

fn require_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, BridgeError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::MalformedInput { detail: format!("missing required field '{field}'") })
}

async fn identity_and_token(
    ctx: &ToolContext,
    agent_id: &str,
) -> Result<(crate::identity::AgentIdentity, String), BridgeError> {
    let store = IdentityStore::new(&ctx.db);
    let identity = store
        .get_by_agent_id(agent_id)?
        .ok_or_else(|| BridgeError::NotFound { detail: format!("unknown agent_id {agent_id}") })?;
    let token = ctx.pool.token_for(agent_id, &identity.localpart, &identity.password_seed).await?;
    Ok((identity, token))
}

async fn op_send(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let body = require_str(&params, "content")?;
    let run_id = params.get("run_id").and_then(Value::as_str).unwrap_or(agent_id);
    let (identity, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = identity
        .room_id
        .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;

    match ctx.arbiter.try_claim(agent_id, run_id).await {
        ClaimOutcome::AlreadyClaimed(_) => Ok(json!({ "sent": false, "reason": "duplicate" })),
        ClaimOutcome::Claimed => {
            let content = json!({ "msgtype": "m.text", "body": body, "bridge_originated": true });
            match ctx.gateway.send_event(&room_id, "m.room.message", &content, &token).await {
                Ok(event_id) => {
                    ctx.arbiter.record_sent(agent_id, run_id, event_id.clone()).await;
                    Ok(json!({ "sent": true, "event_id": event_id }))
                }
                Err(e) => {
                    ctx.arbiter.record_failed(agent_id, run_id).await;
                    Err(e)
                }
            }
        }
    }
}

async fn op_read(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(20) as u32;
    let (identity, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = identity
        .room_id
        .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;
    let messages = ctx.gateway.get_messages(&room_id, &token, "b", limit).await?;
    Ok(json!({ "messages": messages }))
}

async fn op_react(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let event_id = require_str(&params, "event_id")?;
    let key = require_str(&params, "key")?;
    let (identity, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = identity
        .room_id
        .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;
    let content = json!({ "m.relates_to": { "rel_type": "m.annotation", "event_id": event_id, "key": key } });
    let reaction_event_id = ctx.gateway.send_event(&room_id, "m.reaction", &content, &token).await?;
    Ok(json!({ "event_id": reaction_event_id }))
}

async fn op_edit(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let event_id = require_str(&params, "event_id")?;
    let new_body = require_str(&params, "content")?;
    let (identity, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = identity
        .room_id
        .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;
    let content = json!({
        "msgtype": "m.text",
        "body": format!("* {new_body}"),
        "m.new_content": { "msgtype": "m.text", "body": new_body },
        "m.relates_to": { "rel_type": "m.replace", "event_id": event_id },
        "bridge_originated": true,
    });
    let edit_event_id = ctx.gateway.send_event(&room_id, "m.room.message", &content, &token).await?;
    Ok(json!({ "event_id": edit_event_id }))
}

async fn op_typing(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let typing = params.get("typing").and_then(Value::as_bool).unwrap_or(true);
    let (identity, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = identity
        .room_id
        .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;
    let content = json!({ "typing": typing, "timeout": 15_000 });
    ctx.gateway.send_event(&room_id, "m.typing", &content, &token).await?;
    Ok(json!({ "ok": true }))
}

async fn op_room_join(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let room_id_or_alias = require_str(&params, "room_id")?;
    let (identity, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = ctx.gateway.join(&token, room_id_or_alias).await?;
    let store = IdentityStore::new(&ctx.db);
    store.bind_room(&identity.agent_id, &room_id)?;
    Ok(json!({ "room_id": room_id }))
}

async fn op_room_leave(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let (_, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = require_str(&params, "room_id")?;
    ctx.gateway.send_event(room_id, "m.room.member", &json!({ "membership": "leave" }), &token).await?;
    Ok(json!({ "ok": true }))
}

async fn op_room_info(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let (identity, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = identity
        .room_id
        .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;
    let state = ctx.gateway.get_state(&room_id, &token).await?;
    Ok(json!({ "room_id": room_id, "state": state }))
}

async fn op_room_list(ctx: &ToolContext, _params: Value) -> Result<Value, BridgeError> {
    let store = IdentityStore::new(&ctx.db);
    let rooms: Vec<_> = store
        .list_active()?
        .into_iter()
        .filter_map(|i| i.room_id.map(|room_id| json!({ "agent_id": i.agent_id, "room_id": room_id })))
        .collect();
    Ok(json!({ "rooms": rooms }))
}

async fn op_room_create(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let name = require_str(&params, "name")?;
    let topic = params.get("topic").and_then(Value::as_str).unwrap_or("");
    let (_, token) = identity_and_token(ctx, agent_id).await?;
    let room_id = ctx.gateway.create_room(&token, name, topic, "private", vec![], vec![]).await?;
    Ok(json!({ "room_id": room_id }))
}

async fn op_room_invite(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let room_id = require_str(&params, "room_id")?;
    let invitee = require_str(&params, "invitee")?;
    let (_, token) = identity_and_token(ctx, agent_id).await?;
    ctx.gateway.invite(room_id, invitee, &token).await?;
    Ok(json!({ "ok": true }))
}

async fn op_identity_get(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let store = IdentityStore::new(&ctx.db);
    let identity = store
        .get_by_agent_id(agent_id)?
        .ok_or_else(|| BridgeError::NotFound { detail: format!("unknown agent_id {agent_id}") })?;
    Ok(serde_json::to_value(identity).unwrap_or(Value::Null))
}

async fn op_identity_list(ctx: &ToolContext, _params: Value) -> Result<Value, BridgeError> {
    let store = IdentityStore::new(&ctx.db);
    Ok(json!({ "identities": store.export_snapshot()? }))
}

async fn op_identity_create(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    let agent_name = require_str(&params, "agent_name")?;
    let store = IdentityStore::new(&ctx.db);
    let identity = store.upsert(agent_id, agent_name, None, None)?;
    Ok(serde_json::to_value(identity).unwrap_or(Value::Null))
}

fn op_identity_derive(params: Value) -> Result<Value, BridgeError> {
    let agent_id = require_str(&params, "agent_id")?;
    Ok(json!({ "localpart": derive_localpart(agent_id) }))
}

async fn op_subscribe(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let session_id = require_str(&params, "session_id")?.to_owned();
    let directory = params.get("directory").and_then(Value::as_str).unwrap_or_default().to_owned();
    let listen_port = params.get("listen_port").and_then(Value::as_u64).unwrap_or(0) as u16;
    let rooms = params
        .get("rooms")
        .and_then(Value::as_array)
        .map(|rooms| rooms.iter().filter_map(|r| r.as_str().map(str::to_owned)).collect())
        .unwrap_or_default();
    ctx.peers.touch(PeerRegistration { session_id, directory, listen_port, rooms }).await;
    Ok(json!({ "ok": true }))
}

async fn op_unsubscribe(ctx: &ToolContext, params: Value) -> Result<Value, BridgeError> {
    let session_id = require_str(&params, "session_id")?;
    ctx.peers.evict(session_id).await;
    Ok(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_operation_lists_valid_operations() {
        let ctx = ToolContext {
            db: Arc::new(Db::open_in_memory().expect("open")),
            gateway: HomeserverGateway::new("http://localhost:0").expect("gateway"),
            pool: Arc::new(ClientPool::new(HomeserverGateway::new("http://localhost:0").expect("gateway"))),
            arbiter: Arc::new(DeliveryArbiter::new(std::time::Duration::from_secs(300))),
            peers: Arc::new(PeerRegistry::new(std::time::Duration::from_secs(300))),
        };
        let err = dispatch(&ctx, "not_a_real_op", json!({})).await.unwrap_err();
        match err {
            BridgeError::MalformedInput { detail } => assert!(detail.contains("send")),
            other => panic!("expected MalformedInput, got {other:?}"),
        }
    }

    #[test]
    fn identity_derive_is_pure() {
        let result = op_identity_derive(json!({ "agent_id": "agent-597b5756-2915" })).expect("derive");
        assert_eq!(result["localpart"], "agent_597b5756_2915");
    }
}
