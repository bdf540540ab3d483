// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tokio::sync::RwLock;

use crate::error::BridgeError;
use crate::gateway::HomeserverGateway;

/// Tracks the single "Agents Space" every agent room must be a child of.
///
/// Applies the validate-before-commit rule: a freshly created replacement
/// space is read back before the pointer is updated. If that second read
/// fails, the old pointer is left untouched and the next tick retries,
/// rather than risking a created-but-invisible space silently replacing a
/// working one.
pub struct AgentsSpace {
    gateway: HomeserverGateway,
    name: String,
    space_id: RwLock<Option<String>>,
}

impl AgentsSpace {
    pub fn new(gateway: HomeserverGateway, name: String) -> Self {
        Self { gateway, name, space_id: RwLock::new(None) }
    }

    /// Ensure the tracked space exists and is reachable, replacing it if not.
    pub async fn ensure_valid(&self, admin_token: &str) -> Result<String, BridgeError> {
        let current = self.space_id.read().await.clone();

        if let Some(space_id) = &current {
            if self.gateway.get_state(space_id, admin_token).await.is_ok() {
                return Ok(space_id.clone());
            }
            tracing::warn!(space_id, "agents space became inaccessible, provisioning replacement");
        }

        let candidate = self
            .gateway
            .create_room(
                admin_token,
                &self.name,
                "",
                "private",
                vec![serde_json::json!({
                    "type": "m.room.create",
                    "content": { "type": "m.space" }
                })],
                vec![],
            )
            .await?;

        // Validate before committing the pointer: a second read must also
        // succeed, otherwise keep whatever pointer we had (possibly none).
        match self.gateway.get_state(&candidate, admin_token).await {
            Ok(_) => {
                *self.space_id.write().await = Some(candidate.clone());
                Ok(candidate)
            }
            Err(e) => {
                tracing::error!(err = %e, candidate, "replacement agents space failed validation, keeping old pointer");
                match current {
                    Some(space_id) => Ok(space_id),
                    None => Err(BridgeError::TransientUpstream {
                        detail: "agents space could not be validated after creation".into(),
                    }),
                }
            }
        }
    }

    pub async fn add_room(&self, admin_token: &str, room_id: &str) -> Result<(), BridgeError> {
        let space_id = self.ensure_valid(admin_token).await?;
        self.gateway
            .set_state(&space_id, "m.space.child", room_id, &serde_json::json!({ "via": [] }), admin_token)
            .await?;
        Ok(())
    }
}
