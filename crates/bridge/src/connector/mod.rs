// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent Runtime Connector: dispatches content to the agent runtime and
//! streams back its response, enforcing at most one in-flight send per
//! conversation.

pub mod conversation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::BridgeError;

/// A single event in a connector `StreamHandle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    PartialText { text: String },
    ToolCall { name: String, arguments: Value },
    ToolResult { name: String, result: Value },
    Reasoning { text: String },
    Terminal { conversation_id: String, run_id: String, content: String },
}

/// A lazy, finite sequence of [`StreamEvent`]s. Restartable only by a
/// caller-held offset; the connector never persists partials itself.
pub struct StreamHandle {
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Thin typed client over the agent runtime's HTTP API.
#[derive(Clone)]
pub struct AgentRuntimeClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl AgentRuntimeClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BridgeError::Fatal { detail: format!("failed to build http client: {e}") })?;
        Ok(Self { base_url: base_url.into(), token, client })
    }

    async fn dispatch(
        &self,
        agent_id: &str,
        conversation_id: &str,
        content: &str,
        metadata: &Value,
    ) -> Result<Vec<StreamEvent>, BridgeError> {
        let mut req = self.client.post(format!(
            "{}/v1/agents/{agent_id}/messages",
            self.base_url.trim_end_matches('/')
        ));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .json(&serde_json::json!({
                "conversation_id": conversation_id,
                "content": content,
                "metadata": metadata,
            }))
            .send()
            .await
            .map_err(|e| BridgeError::TransientUpstream { detail: format!("agent runtime request failed: {e}") })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BridgeError::RateLimited { retry_after_ms: 1000 });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BridgeError::AuthExpired);
        }
        if status.is_server_error() {
            return Err(BridgeError::TransientUpstream { detail: format!("agent runtime returned {status}") });
        }
        if !status.is_success() {
            return Err(BridgeError::Fatal { detail: format!("agent runtime returned {status}") });
        }

        let body: AgentRuntimeResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::TransientUpstream { detail: format!("malformed agent runtime body: {e}") })?;

        Ok(vec![StreamEvent::Terminal {
            conversation_id: conversation_id.to_owned(),
            run_id: body.run_id,
            content: body.content,
        }])
    }
}

#[derive(Debug, Deserialize)]
struct AgentRuntimeResponse {
    run_id: String,
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeAgentListEntry {
    pub id: String,
    pub name: String,
}

impl AgentRuntimeClient {
    /// Fetch the runtime's authoritative agent list, backing the
    /// Reconciler's new/renamed/unchanged/missing diff.
    pub async fn list_agents(&self) -> Result<Vec<RuntimeAgentListEntry>, BridgeError> {
        let mut req =
            self.client.get(format!("{}/v1/agents", self.base_url.trim_end_matches('/')));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BridgeError::TransientUpstream { detail: format!("agent list request failed: {e}") })?;
        if !resp.status().is_success() {
            return Err(BridgeError::TransientUpstream {
                detail: format!("agent runtime returned {}", resp.status()),
            });
        }
        resp.json()
            .await
            .map_err(|e| BridgeError::TransientUpstream { detail: format!("malformed agent list body: {e}") })
    }
}

/// Tracks at-most-one in-flight send per `conversation_id` and retries
/// transient/rate-limit failures with exponential backoff (1s, 2s, 4s).
pub struct AgentRuntimeConnector {
    client: AgentRuntimeClient,
    max_retries: u32,
    in_flight: Mutex<HashMap<String, ()>>,
}

impl AgentRuntimeConnector {
    pub fn new(client: AgentRuntimeClient, max_retries: u32) -> Self {
        Self { client, max_retries, in_flight: Mutex::new(HashMap::new()) }
    }

    pub async fn send(
        self: &Arc<Self>,
        agent_id: &str,
        conversation_id: &str,
        content: &str,
        metadata: Value,
    ) -> Result<StreamHandle, BridgeError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(conversation_id) {
                return Err(BridgeError::ConversationBusy { conversation_id: conversation_id.to_owned() });
            }
            in_flight.insert(conversation_id.to_owned(), ());
        }

        let (tx, rx) = mpsc::channel(8);
        let this = Arc::clone(self);
        let agent_id = agent_id.to_owned();
        let conversation_id = conversation_id.to_owned();
        let content = content.to_owned();

        tokio::spawn(async move {
            let result = send_with_backoff(&this.client, &agent_id, &conversation_id, &content, &metadata, this.max_retries)
                .await;
            match result {
                Ok(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(agent_id, conversation_id, err = %e, "agent runtime send failed");
                }
            }
            this.in_flight.lock().await.remove(&conversation_id);
        });

        Ok(StreamHandle { events: rx })
    }
}

async fn send_with_backoff(
    client: &AgentRuntimeClient,
    agent_id: &str,
    conversation_id: &str,
    content: &str,
    metadata: &Value,
    max_retries: u32,
) -> Result<Vec<StreamEvent>, BridgeError> {
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        match client.dispatch(agent_id, conversation_id, content, metadata).await {
            Ok(events) => return Ok(events),
            Err(e) if e.is_retryable() && attempt < max_retries.min(3) => {
                attempt += 1;
                tracing::warn!(agent_id, conversation_id, attempt, "agent runtime send failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(BridgeError::RateLimited { .. }) | Err(BridgeError::TransientUpstream { .. }) => {
                return Err(BridgeError::TransientUpstream {
                    detail: "agent runtime send exhausted retry budget".into(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}
