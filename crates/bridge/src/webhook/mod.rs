// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Webhook Ingress: the HTTP endpoint receiving asynchronous agent-run
//! completions and posting them back to Matrix as the correct identity.

pub mod signature;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::arbiter::{ClaimOutcome, DeliveryArbiter};
use crate::config::WebhookVerifyMode;
use crate::error::BridgeError;
use crate::gateway::{ClientPool, HomeserverGateway};
use crate::health::HealthTracker;
use crate::identity::store::IdentityStore;
use crate::storage::Db;

/// Payload accepted from the agent runtime's completion webhook.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookPayload {
    pub agent_id: String,
    pub run_id: String,
    pub messages: Vec<Value>,
}

pub struct WebhookIngress {
    db: Arc<Db>,
    gateway: HomeserverGateway,
    pool: Arc<ClientPool>,
    arbiter: Arc<DeliveryArbiter>,
    verify_mode: WebhookVerifyMode,
    secret: Option<String>,
    replay_window: Duration,
    seen_runs: Mutex<HashSet<(String, String)>>,
    health: Arc<HealthTracker>,
}

impl WebhookIngress {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        gateway: HomeserverGateway,
        pool: Arc<ClientPool>,
        arbiter: Arc<DeliveryArbiter>,
        verify_mode: WebhookVerifyMode,
        secret: Option<String>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            db,
            gateway,
            pool,
            arbiter,
            verify_mode,
            secret,
            replay_window: Duration::from_secs(5 * 60),
            seen_runs: Mutex::new(HashSet::new()),
            health,
        }
    }

    /// Verify the `t=<unix>,v1=<hex>` signature header against the raw body.
    /// No-op (always accepts) in bypass mode.
    pub fn verify_signature(&self, header: Option<&str>, raw_body: &[u8]) -> Result<(), BridgeError> {
        if matches!(self.verify_mode, WebhookVerifyMode::Bypass) {
            return Ok(());
        }
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| BridgeError::Fatal { detail: "webhook verification enabled with no secret configured".into() })?;
        let header = header.ok_or(BridgeError::Unauthorized)?;
        let now = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        signature::verify(header, raw_body, secret, now, self.replay_window)
    }

    /// Process one webhook delivery: extract content, dedup, resolve the
    /// room, and post through the Delivery Arbiter. Returns `Ok(true)` if a
    /// message was actually sent, `Ok(false)` for a no-op (empty extraction
    /// or duplicate).
    pub async fn handle(&self, payload: WebhookPayload) -> Result<bool, BridgeError> {
        if payload.agent_id.is_empty() || payload.run_id.is_empty() {
            return Err(BridgeError::MalformedInput { detail: "agent_id and run_id are required".into() });
        }

        let key = (payload.agent_id.clone(), payload.run_id.clone());
        if self.seen_runs.lock().await.contains(&key) {
            return Ok(false);
        }

        let content = match extract_assistant_content(&payload.messages) {
            Some(content) if !content.is_empty() => content,
            _ => return Ok(false),
        };

        let store = IdentityStore::new(&self.db);
        let identity = store
            .get_by_agent_id(&payload.agent_id)?
            .ok_or_else(|| BridgeError::NotFound { detail: format!("unknown agent_id {}", payload.agent_id) })?;
        let room_id = identity
            .room_id
            .clone()
            .ok_or_else(|| BridgeError::NotFound { detail: "agent has no bound room".into() })?;

        match self.arbiter.try_claim(&payload.agent_id, &payload.run_id).await {
            ClaimOutcome::AlreadyClaimed(_) => Ok(false),
            ClaimOutcome::Claimed => {
                let token =
                    self.pool.token_for(&payload.agent_id, &identity.localpart, &identity.password_seed).await?;
                let body = serde_json::json!({
                    "msgtype": "m.text",
                    "body": content,
                    "bridge_originated": true,
                });
                match self.gateway.send_event(&room_id, "m.room.message", &body, &token).await {
                    Ok(event_id) => {
                        self.arbiter.record_sent(&payload.agent_id, &payload.run_id, event_id).await;
                        // Only mark the run seen once it is actually posted,
                        // so a delivery that fails downstream stays retryable
                        // instead of being silently swallowed on reattempt.
                        self.seen_runs.lock().await.insert(key);
                        Ok(true)
                    }
                    Err(e) => {
                        self.arbiter.record_failed(&payload.agent_id, &payload.run_id).await;
                        self.health.record_delivery_failure();
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Reverse-scan the message array for the last assistant-kind entry and
/// extract its text. Content shapes accepted: a plain string, an array of
/// typed parts (concatenating `text`-typed parts in order), or an object
/// with a `text` field.
fn extract_assistant_content(messages: &[Value]) -> Option<String> {
    for message in messages.iter().rev() {
        let role = message.get("role").and_then(Value::as_str);
        if role != Some("assistant") {
            continue;
        }
        let Some(content) = message.get("content") else { continue };
        if let Some(text) = extract_content_text(content) {
            return Some(text);
        }
    }
    None
}

fn extract_content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let joined: String = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            Some(joined)
        }
        Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(str::to_owned),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_string_content() {
        let messages = vec![serde_json::json!({"role": "user", "content": "hi"})
            , serde_json::json!({"role": "assistant", "content": "hi alice"})];
        assert_eq!(extract_assistant_content(&messages), Some("hi alice".to_owned()));
    }

    #[test]
    fn extracts_concatenated_typed_parts() {
        let messages = vec![serde_json::json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "hello "},
                {"type": "image", "url": "x"},
                {"type": "text", "text": "world"}
            ]
        })];
        assert_eq!(extract_assistant_content(&messages), Some("hello world".to_owned()));
    }

    #[test]
    fn extracts_object_with_text_field() {
        let messages = vec![serde_json::json!({"role": "assistant", "content": {"text": "done"}})];
        assert_eq!(extract_assistant_content(&messages), Some("done".to_owned()));
    }

    #[test]
    fn reverse_scans_for_last_assistant_entry() {
        let messages = vec![
            serde_json::json!({"role": "assistant", "content": "first"}),
            serde_json::json!({"role": "user", "content": "interrupting"}),
            serde_json::json!({"role": "assistant", "content": "second"}),
        ];
        assert_eq!(extract_assistant_content(&messages), Some("second".to_owned()));
    }

    #[test]
    fn no_assistant_entry_returns_none() {
        let messages = vec![serde_json::json!({"role": "user", "content": "hi"})];
        assert_eq!(extract_assistant_content(&messages), None);
    }
}
