// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sync Engine: drives one Matrix `/sync` long-poll loop per identity.

pub mod cursor;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::gateway::{ClientPool, HomeserverGateway};
use crate::sync::cursor::CursorStore;

/// Receives the batch of raw timeline events a sync cycle produced, along
/// with the cold-start watermark in effect for that batch.
///
/// Implementations must be idempotent on `event_id`, since a sync timeout
/// restarts from a fresh initial sync and may redeliver an already-seen tail.
#[async_trait::async_trait]
pub trait SyncEventSink: Send + Sync {
    async fn handle_batch(&self, agent_id: &str, watermark: DateTime<Utc>, events: Vec<serde_json::Value>);
}

/// Runs one identity's sync loop until `cancel` fires.
///
/// On start, loads the persisted cursor. If absent, performs a zero-limit
/// initial sync to obtain a fresh cursor and sets the cold-start watermark
/// to the current wall clock — pre-existing room history is ignored, never
/// replayed. `AuthExpired` triggers a Client Pool token renewal before the
/// next iteration; a sync timeout deliberately restarts from a fresh initial
/// sync rather than stalling, trading possible event loss for liveness.
pub struct SyncEngine<'a> {
    gateway: HomeserverGateway,
    pool: Arc<ClientPool>,
    cursors: CursorStore<'a>,
    sync_timeout: Duration,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        gateway: HomeserverGateway,
        pool: Arc<ClientPool>,
        cursors: CursorStore<'a>,
        sync_timeout: Duration,
    ) -> Self {
        Self { gateway, pool, cursors, sync_timeout }
    }

    pub async fn run(
        &self,
        agent_id: &str,
        localpart: &str,
        password_seed: &str,
        sink: Arc<dyn SyncEventSink>,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let mut watermark = Utc::now();
        let mut since = self.cursors.load(agent_id)?;
        if since.is_none() {
            let token = self.pool.token_for(agent_id, localpart, password_seed).await?;
            let initial = self.gateway.sync(&token, None, None, Duration::from_millis(0)).await?;
            self.cursors.store(agent_id, &initial.next_batch)?;
            since = Some(initial.next_batch);
            watermark = Utc::now();
            tracing::info!(agent_id, %watermark, "cold-started sync cursor");
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let token = self.pool.token_for(agent_id, localpart, password_seed).await?;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.gateway.sync(&token, since.as_deref(), None, self.sync_timeout) => result,
            };

            match result {
                Ok(batch) => {
                    sink.handle_batch(agent_id, watermark, batch.events).await;
                    self.cursors.store(agent_id, &batch.next_batch)?;
                    since = Some(batch.next_batch);
                }
                Err(BridgeError::AuthExpired) => {
                    tracing::warn!(agent_id, "sync saw AuthExpired, renewing credential");
                    self.pool.renew(agent_id, localpart, password_seed).await?;
                }
                Err(BridgeError::TransientUpstream { detail }) => {
                    tracing::warn!(agent_id, detail, "sync timed out or hit a transient error, restarting cold");
                    let token = self.pool.token_for(agent_id, localpart, password_seed).await?;
                    let initial = self.gateway.sync(&token, None, None, Duration::from_millis(0)).await?;
                    self.cursors.store(agent_id, &initial.next_batch)?;
                    since = Some(initial.next_batch);
                    watermark = Utc::now();
                }
                Err(e) => return Err(e),
            }
        }
    }
}
