// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sync Engine Supervisor: keeps exactly one running Sync Engine task per
//! active Identity Store entry, starting new ones and cancelling stale ones
//! as the Reconciler's view of the world changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::gateway::{ClientPool, HomeserverGateway};
use crate::health::HealthTracker;
use crate::identity::store::IdentityStore;
use crate::storage::Db;
use crate::sync::cursor::CursorStore;
use crate::sync::{SyncEngine, SyncEventSink};

struct RunningEngine {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SyncSupervisor {
    db: Arc<Db>,
    gateway: HomeserverGateway,
    pool: Arc<ClientPool>,
    sink: Arc<dyn SyncEventSink>,
    sync_timeout: Duration,
    health: Arc<HealthTracker>,
}

impl SyncSupervisor {
    pub fn new(
        db: Arc<Db>,
        gateway: HomeserverGateway,
        pool: Arc<ClientPool>,
        sink: Arc<dyn SyncEventSink>,
        sync_timeout: Duration,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self { db, gateway, pool, sink, sync_timeout, health }
    }

    /// Poll the Identity Store at `poll_interval` and keep one Sync Engine
    /// task alive per active, room-bound identity until `cancel` fires.
    pub async fn run(&self, poll_interval: Duration, cancel: CancellationToken) {
        let mut running: HashMap<String, RunningEngine> = HashMap::new();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.reconcile_engines(&mut running, &cancel);
        }

        for (_, engine) in running {
            engine.cancel.cancel();
            let _ = engine.handle.await;
        }
    }

    fn reconcile_engines(&self, running: &mut HashMap<String, RunningEngine>, parent: &CancellationToken) {
        let store = IdentityStore::new(&self.db);
        let active = match store.list_active() {
            Ok(identities) => identities,
            Err(e) => {
                tracing::error!(err = %e, "sync supervisor failed to list active identities");
                return;
            }
        };

        let active_ids: HashSet<String> =
            active.iter().filter(|i| i.room_id.is_some()).map(|i| i.agent_id.clone()).collect();

        running.retain(|agent_id, engine| {
            if active_ids.contains(agent_id) {
                true
            } else {
                tracing::info!(agent_id, "stopping sync engine for deactivated identity");
                engine.cancel.cancel();
                false
            }
        });

        for identity in active {
            if identity.room_id.is_none() || running.contains_key(&identity.agent_id) {
                continue;
            }

            let child_cancel = parent.child_token();
            let engine_cancel = child_cancel.clone();
            let db = Arc::clone(&self.db);
            let gateway = self.gateway.clone();
            let pool = Arc::clone(&self.pool);
            let sink = Arc::clone(&self.sink);
            let sync_timeout = self.sync_timeout;
            let health = Arc::clone(&self.health);
            let agent_id = identity.agent_id.clone();
            let localpart = identity.localpart.clone();
            let password_seed = identity.password_seed.clone();

            let handle = tokio::spawn(async move {
                let cursors = CursorStore::new(&db);
                let engine = SyncEngine::new(gateway, pool, cursors, sync_timeout);
                if let Err(e) = engine.run(&agent_id, &localpart, &password_seed, sink, engine_cancel).await {
                    health.record_sync_failure();
                    tracing::error!(agent_id, err = %e, "sync engine exited with error");
                }
            });

            tracing::info!(agent_id = %identity.agent_id, "started sync engine for active identity");
            running.insert(identity.agent_id.clone(), RunningEngine { cancel: child_cancel, handle });
        }
    }
}
