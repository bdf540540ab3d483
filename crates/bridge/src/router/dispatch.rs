// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wires the classifier to the rest of the bridge: resolves a conversation
//! id for each forwarded event, calls the Connector, and drains its stream
//! through the Delivery Arbiter back onto Matrix.
//!
//! This is the [`crate::sync::SyncEventSink`] every Sync Engine instance
//! drives its batches through. Events within a single `handle_batch` call
//! are awaited one at a time, which is what gives per-room ordering: a Sync
//! Engine instance drives exactly one identity's own room, so its batches
//! are already single-room by construction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::Instrument;

use crate::arbiter::{ClaimOutcome, DeliveryArbiter};
use crate::connector::conversation::ConversationStore;
use crate::connector::{AgentRuntimeConnector, StreamEvent};
use crate::error::BridgeError;
use crate::gateway::{ClientPool, HomeserverGateway};
use crate::health::HealthTracker;
use crate::identity::store::IdentityStore;
use crate::router::{classify, ClassificationOutcome, DropReason, IncomingEvent, RoomOwnerLookup};
use crate::storage::Db;
use crate::sync::SyncEventSink;

/// Adapts the Identity Store's `get_by_room_id` to the classifier's
/// minimal [`RoomOwnerLookup`] seam.
struct IdentityLookup<'a>(&'a IdentityStore<'a>);

impl RoomOwnerLookup for IdentityLookup<'_> {
    fn owning_agent(&self, room_id: &str) -> Option<(String, String)> {
        self.0.get_by_room_id(room_id).ok().flatten().map(|identity| (identity.agent_id, identity.mxid))
    }
}

/// Turns classified timeline events into agent runtime calls and posts the
/// runtime's terminal response back to Matrix through the Delivery Arbiter.
pub struct RouterSink {
    db: Arc<Db>,
    gateway: HomeserverGateway,
    pool: Arc<ClientPool>,
    connector: Arc<AgentRuntimeConnector>,
    arbiter: Arc<DeliveryArbiter>,
    health: Arc<HealthTracker>,
}

impl RouterSink {
    pub fn new(
        db: Arc<Db>,
        gateway: HomeserverGateway,
        pool: Arc<ClientPool>,
        connector: Arc<AgentRuntimeConnector>,
        arbiter: Arc<DeliveryArbiter>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self { db, gateway, pool, connector, arbiter, health }
    }

    async fn forward(&self, owning_agent_id: &str, event: &IncomingEvent) -> Result<(), BridgeError> {
        let IncomingEvent::Message { event_id, room_id, sender, content, .. } = event else {
            return Ok(());
        };
        let body = content.get("body").and_then(Value::as_str).unwrap_or_default();
        if body.is_empty() {
            return Ok(());
        }

        let conversations = ConversationStore::new(&self.db);
        let conversation_id = conversations.get_or_create(room_id, owning_agent_id, "")?;
        conversations.touch(&conversation_id)?;

        let metadata = json!({ "sender": sender, "room_id": room_id, "triggering_event_id": event_id });
        let handle = self.connector.send(owning_agent_id, &conversation_id, body, metadata).await?;
        self.drain_stream(owning_agent_id, room_id, handle).await;
        Ok(())
    }

    async fn drain_stream(&self, agent_id: &str, room_id: &str, mut handle: crate::connector::StreamHandle) {
        while let Some(stream_event) = handle.events.recv().await {
            let StreamEvent::Terminal { run_id, content, .. } = stream_event else { continue };
            if content.is_empty() {
                continue;
            }
            // Keyed on the agent runtime's own run_id, same as the webhook
            // path, so a completion observed on both paths collapses onto a
            // single Delivery Arbiter entry.
            if let Err(e) = self.post_completion(agent_id, room_id, &run_id, &content).await {
                tracing::error!(agent_id, room_id, err = %e, "failed to post agent completion to matrix");
            }
        }
    }

    async fn post_completion(
        &self,
        agent_id: &str,
        room_id: &str,
        run_id: &str,
        content: &str,
    ) -> Result<(), BridgeError> {
        match self.arbiter.try_claim(agent_id, run_id).await {
            ClaimOutcome::AlreadyClaimed(_) => Ok(()),
            ClaimOutcome::Claimed => {
                let store = IdentityStore::new(&self.db);
                let identity = store
                    .get_by_agent_id(agent_id)?
                    .ok_or_else(|| BridgeError::NotFound { detail: format!("unknown agent_id {agent_id}") })?;
                let token = self.pool.token_for(agent_id, &identity.localpart, &identity.password_seed).await?;
                let body = json!({ "msgtype": "m.text", "body": content, "bridge_originated": true });
                match self.gateway.send_event(room_id, "m.room.message", &body, &token).await {
                    Ok(event_id) => {
                        self.arbiter.record_sent(agent_id, run_id, event_id).await;
                        Ok(())
                    }
                    Err(e) => {
                        self.arbiter.record_failed(agent_id, run_id).await;
                        self.health.record_delivery_failure();
                        Err(e)
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl SyncEventSink for RouterSink {
    async fn handle_batch(&self, agent_id: &str, watermark: DateTime<Utc>, events: Vec<Value>) {
        let store = IdentityStore::new(&self.db);
        let lookup = IdentityLookup(&store);

        for raw in events {
            let event = IncomingEvent::from_raw(&raw);
            let outcome = classify(&event, watermark, &lookup);
            match outcome {
                ClassificationOutcome::ForwardToRuntime { owning_agent_id } => {
                    let span = tracing::info_span!("forward_event", agent_id = %owning_agent_id, sync_agent_id = agent_id);
                    if let Err(e) = self.forward(&owning_agent_id, &event).instrument(span).await {
                        tracing::error!(agent_id = %owning_agent_id, err = %e, "failed to forward event to runtime");
                    }
                }
                ClassificationOutcome::Drop(reason) => {
                    if !matches!(reason, DropReason::NotMessageType) {
                        tracing::debug!(?reason, agent_id, "dropped timeline event");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_lookup_resolves_owning_agent_from_room_binding() {
        let db = Db::open_in_memory().expect("open db");
        let store = IdentityStore::new(&db);
        store
            .upsert("agent-1", "Meridian", Some("@agent_1:example.org"), Some("!room:example.org"))
            .expect("upsert");
        store.bind_room("agent-1", "!room:example.org").expect("bind");

        let lookup = IdentityLookup(&store);
        let owner = lookup.owning_agent("!room:example.org");
        assert_eq!(owner, Some(("agent-1".to_owned(), "@agent_1:example.org".to_owned())));
    }

    #[test]
    fn identity_lookup_returns_none_for_unknown_room() {
        let db = Db::open_in_memory().expect("open db");
        let store = IdentityStore::new(&db);
        let lookup = IdentityLookup(&store);
        assert_eq!(lookup.owning_agent("!nope:example.org"), None);
    }
}
