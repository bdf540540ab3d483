// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-identity bridge: bridges a Matrix homeserver to a population of
//! agents hosted on an external agent runtime, giving each agent its own
//! Matrix identity and room and routing messages between them.

pub mod arbiter;
pub mod config;
pub mod connector;
pub mod error;
pub mod gateway;
pub mod health;
pub mod identity;
pub mod peer;
pub mod reconcile;
pub mod router;
pub mod rest;
pub mod storage;
pub mod supervisor;
pub mod sync;
pub mod tool;
pub mod webhook;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::arbiter::DeliveryArbiter;
use crate::config::BridgeConfig;
use crate::connector::{AgentRuntimeClient, AgentRuntimeConnector};
use crate::gateway::{ClientPool, HomeserverGateway};
use crate::health::HealthTracker;
use crate::peer::PeerRegistry;
use crate::reconcile::Reconciler;
use crate::router::RouterSink;
use crate::storage::Db;
use crate::supervisor::SyncSupervisor;
use crate::webhook::WebhookIngress;

/// Shared state handed to every REST handler.
pub struct BridgeState {
    pub db: Arc<Db>,
    pub gateway: HomeserverGateway,
    pub pool: Arc<ClientPool>,
    pub arbiter: Arc<DeliveryArbiter>,
    pub peers: Arc<PeerRegistry>,
    pub webhook: Arc<WebhookIngress>,
    pub health: Arc<HealthTracker>,
    pub admin_bearer_token: Option<String>,
}

/// Build every component, spawn the Reconciler and Sync Supervisor, and
/// serve the REST surface until `cancel` fires (or forever, if the caller
/// never cancels it).
pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let shutdown = CancellationToken::new();

    let db = Arc::new(Db::open(&config.database_path)?);
    let gateway = HomeserverGateway::new(&config.homeserver_url)?;
    let pool = Arc::new(ClientPool::new(gateway.clone()));
    let arbiter = Arc::new(DeliveryArbiter::new(config.inflight_ttl()));
    let peers = Arc::new(PeerRegistry::new(config.inflight_ttl()));
    let health = Arc::new(HealthTracker::new());

    let runtime_client = AgentRuntimeClient::new(
        config.agent_runtime_url.clone(),
        config.agent_runtime_token.clone(),
    )?;
    let connector = Arc::new(AgentRuntimeConnector::new(
        runtime_client.clone(),
        config.rate_limit_max_retries,
    ));

    let webhook = Arc::new(WebhookIngress::new(
        Arc::clone(&db),
        gateway.clone(),
        Arc::clone(&pool),
        Arc::clone(&arbiter),
        config.webhook_verify,
        config.webhook_secret.clone(),
        Arc::clone(&health),
    ));

    let directory = Arc::new(runtime_client);
    let reconciler = Reconciler::new(
        Arc::clone(&db),
        gateway.clone(),
        Arc::clone(&pool),
        directory,
        config.agents_space_name.clone(),
        config.admin_localpart.clone(),
        config.admin_password.clone(),
        Arc::clone(&health),
    );

    let router_sink: Arc<dyn sync::SyncEventSink> = Arc::new(RouterSink::new(
        Arc::clone(&db),
        gateway.clone(),
        Arc::clone(&pool),
        Arc::clone(&connector),
        Arc::clone(&arbiter),
        Arc::clone(&health),
    ));
    let supervisor = SyncSupervisor::new(
        Arc::clone(&db),
        gateway.clone(),
        Arc::clone(&pool),
        router_sink,
        config.sync_timeout(),
        Arc::clone(&health),
    );

    let reconciler_cancel = shutdown.child_token();
    let reconcile_interval = config.reconcile_interval();
    tokio::spawn(async move { reconciler.run(reconcile_interval, reconciler_cancel).await });

    let supervisor_cancel = shutdown.child_token();
    tokio::spawn(async move { supervisor.run(reconcile_interval, supervisor_cancel).await });

    let state = Arc::new(BridgeState {
        db,
        gateway,
        pool,
        arbiter,
        peers,
        webhook,
        health,
        admin_bearer_token: config.admin_bearer_token.clone(),
    });

    tracing::info!(%addr, "agent-bridge listening");
    let app = rest::build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
