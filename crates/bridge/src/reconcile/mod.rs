// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconciler: the periodic control loop that diffs the agent runtime's
//! authoritative agent list against the Identity Store and converges Matrix
//! state (accounts, rooms, space membership) onto it.

pub mod agents_space;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connector::AgentRuntimeClient;
use crate::error::BridgeError;
use crate::gateway::{ClientPool, HomeserverGateway};
use crate::health::HealthTracker;
use crate::identity::store::IdentityStore;
use crate::reconcile::agents_space::AgentsSpace;
use crate::storage::Db;

/// One entry from the agent runtime's authoritative agent list.
#[derive(Debug, Clone)]
pub struct LiveAgent {
    pub agent_id: String,
    pub agent_name: String,
}

/// Source of the authoritative agent list the Reconciler diffs against.
#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<LiveAgent>, BridgeError>;
}

#[async_trait::async_trait]
impl AgentDirectory for AgentRuntimeClient {
    async fn list_agents(&self) -> Result<Vec<LiveAgent>, BridgeError> {
        let entries = AgentRuntimeClient::list_agents(self).await?;
        Ok(entries.into_iter().map(|e| LiveAgent { agent_id: e.id, agent_name: e.name }).collect())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Diff {
    New,
    Renamed,
    Unchanged,
}

pub struct Reconciler {
    db: Arc<Db>,
    gateway: HomeserverGateway,
    pool: Arc<ClientPool>,
    directory: Arc<dyn AgentDirectory>,
    space: AgentsSpace,
    admin_localpart: String,
    admin_password: String,
    health: Arc<HealthTracker>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        gateway: HomeserverGateway,
        pool: Arc<ClientPool>,
        directory: Arc<dyn AgentDirectory>,
        space_name: String,
        admin_localpart: String,
        admin_password: String,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            db,
            gateway: gateway.clone(),
            pool,
            directory,
            space: AgentsSpace::new(gateway, space_name),
            admin_localpart,
            admin_password,
            health,
        }
    }

    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.tick().await {
                Ok(()) => self.health.record_reconcile_success(),
                Err(e) => {
                    self.health.record_reconcile_failure();
                    tracing::error!(err = %e, "reconciler tick failed");
                }
            }
        }
    }

    async fn admin_token(&self) -> Result<String, BridgeError> {
        self.gateway.login(&self.admin_localpart, &self.admin_password).await
    }

    pub async fn tick(&self) -> Result<(), BridgeError> {
        let admin_token = self.admin_token().await?;
        self.space.ensure_valid(&admin_token).await?;

        let live_agents = self.directory.list_agents().await?;
        let store = IdentityStore::new(&self.db);
        let live_ids: std::collections::HashSet<_> =
            live_agents.iter().map(|a| a.agent_id.clone()).collect();

        for live in &live_agents {
            let existing = store.get_by_agent_id(&live.agent_id)?;
            let diff = match &existing {
                None => Diff::New,
                Some(identity) if identity.agent_name != live.agent_name => Diff::Renamed,
                Some(_) => Diff::Unchanged,
            };

            let result = match diff {
                Diff::New => self.provision_new(&store, live, &admin_token).await,
                Diff::Renamed => self.apply_rename(&store, live).await,
                Diff::Unchanged => self.validate_unchanged(&store, live, &admin_token).await,
            };
            if let Err(e) = result {
                self.health.record_provisioning_failure();
                tracing::error!(agent_id = %live.agent_id, ?diff, err = %e, "failed to reconcile agent identity");
            }
        }

        for identity in store.list_active()? {
            if !live_ids.contains(&identity.agent_id) {
                store.mark_removed(&identity.agent_id)?;
                tracing::info!(agent_id = %identity.agent_id, "agent missing from runtime, soft-removed");
            }
        }

        Ok(())
    }

    async fn provision_new(
        &self,
        store: &IdentityStore<'_>,
        live: &LiveAgent,
        admin_token: &str,
    ) -> Result<(), BridgeError> {
        let localpart = resolve_localpart(store, &live.agent_id)?;
        let password_seed = uuid::Uuid::new_v4().to_string();

        let (mxid, token) = match self.gateway.register(&localpart, &password_seed, None).await {
            Ok(pair) => pair,
            Err(BridgeError::IdentityConflict { .. }) => {
                let token = self.gateway.login(&localpart, &password_seed).await?;
                let mxid = self.gateway.whoami(&token).await?;
                (mxid, token)
            }
            Err(e) => return Err(e),
        };

        self.gateway.set_display_name(&mxid, &token, &live.agent_name).await?;

        let room_name = format!("{} - Agent Chat", live.agent_name);
        let room_id = self
            .gateway
            .create_room(&token, &room_name, "", "private", vec![], vec![])
            .await?;

        let identity =
            store.upsert_with_localpart(&live.agent_id, &live.agent_name, Some(&mxid), Some(&room_id), Some(&localpart))?;
        store.bind_room(&identity.agent_id, &room_id)?;

        self.space.add_room(admin_token, &room_id).await?;
        tracing::info!(agent_id = %live.agent_id, %mxid, %room_id, "provisioned new agent identity");
        Ok(())
    }

    async fn apply_rename(&self, store: &IdentityStore<'_>, live: &LiveAgent) -> Result<(), BridgeError> {
        let identity = store.upsert(&live.agent_id, &live.agent_name, None, None)?;
        if let Some(room_id) = &identity.room_id {
            let token = self.pool.token_for(&live.agent_id, &identity.localpart, &identity.password_seed).await?;
            let room_name = format!("{} - Agent Chat", live.agent_name);
            self.gateway
                .set_state(room_id, "m.room.name", "", &serde_json::json!({ "name": room_name }), &token)
                .await?;
        }
        Ok(())
    }

    async fn validate_unchanged(
        &self,
        store: &IdentityStore<'_>,
        live: &LiveAgent,
        admin_token: &str,
    ) -> Result<(), BridgeError> {
        let identity = store
            .get_by_agent_id(&live.agent_id)?
            .ok_or_else(|| BridgeError::Fatal { detail: "identity vanished mid-tick".into() })?;

        let Some(room_id) = identity.room_id.clone() else {
            return self.provision_new(store, live, admin_token).await;
        };

        let token = self.pool.token_for(&live.agent_id, &identity.localpart, &identity.password_seed).await?;
        match self.gateway.get_state(&room_id, &token).await {
            Ok(_) => Ok(()),
            Err(BridgeError::NotFound { .. }) => {
                tracing::warn!(agent_id = %live.agent_id, %room_id, "canonical room missing, recreating");
                self.provision_new(store, live, admin_token).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Resolves the localpart to provision a brand-new agent identity under,
/// appending a numeric suffix when the naturally-derived localpart already
/// belongs to a different `agent_id`. The earlier-created identity always
/// keeps its localpart; only the later arrival gets renamed.
fn resolve_localpart(store: &IdentityStore<'_>, agent_id: &str) -> Result<String, BridgeError> {
    let base = crate::identity::derive_localpart(agent_id);
    if matches!(store.get_by_localpart(&base)?, None) {
        return Ok(base);
    }

    let mut suffix = 2u32;
    loop {
        let candidate = format!("{base}_{suffix}");
        match store.get_by_localpart(&candidate)? {
            None => return Ok(candidate),
            Some(identity) if identity.agent_id == agent_id => return Ok(candidate),
            Some(_) => suffix += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_localpart_returns_base_when_unclaimed() {
        let db = Db::open_in_memory().expect("open db");
        let store = IdentityStore::new(&db);
        let localpart = resolve_localpart(&store, "agent-meridian").expect("resolve");
        assert_eq!(localpart, "agent_meridian");
    }

    #[test]
    fn resolve_localpart_appends_numeric_suffix_on_collision() {
        let db = Db::open_in_memory().expect("open db");
        let store = IdentityStore::new(&db);
        // "agent-foo-bar" and "foo-bar" both derive to "agent_foo_bar".
        store
            .upsert("agent-foo-bar", "Foo Bar", Some("@agent_foo_bar:example.org"), None)
            .expect("seed first owner");

        let localpart = resolve_localpart(&store, "foo-bar").expect("resolve");
        assert_eq!(localpart, "agent_foo_bar_2");
    }

    #[test]
    fn resolve_localpart_skips_suffixes_already_taken_by_other_agents() {
        let db = Db::open_in_memory().expect("open db");
        let store = IdentityStore::new(&db);
        // "agent-foo-bar", "foo-bar" and "foo_bar" all derive to "agent_foo_bar".
        store
            .upsert("agent-foo-bar", "Foo Bar", Some("@agent_foo_bar:example.org"), None)
            .expect("seed first owner");
        store
            .upsert_with_localpart(
                "foo-bar",
                "Foo Bar Two",
                Some("@agent_foo_bar_2:example.org"),
                None,
                Some("agent_foo_bar_2"),
            )
            .expect("seed second owner");

        let localpart = resolve_localpart(&store, "foo_bar").expect("resolve");
        assert_eq!(localpart, "agent_foo_bar_3");
    }

    #[test]
    fn resolve_localpart_is_idempotent_for_the_same_agent_id() {
        let db = Db::open_in_memory().expect("open db");
        let store = IdentityStore::new(&db);
        store
            .upsert("agent-foo-bar", "Foo Bar", Some("@agent_foo_bar:example.org"), None)
            .expect("seed owner");

        let localpart = resolve_localpart(&store, "agent-foo-bar").expect("resolve");
        assert_eq!(localpart, "agent_foo_bar");
    }
}
