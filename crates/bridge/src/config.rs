// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the agent-identity bridge.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "agent-bridge", about = "Bridges a Matrix homeserver to agent-runtime-hosted agents")]
pub struct BridgeConfig {
    /// Host to bind the REST/webhook surface on.
    #[arg(long, default_value = "127.0.0.1", env = "BRIDGE_BIND_HOST")]
    pub bind_host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8800, env = "BRIDGE_BIND_PORT")]
    pub bind_port: u16,

    /// Bearer token gating admin and ingress endpoints. If unset, auth is disabled.
    #[arg(long, env = "BRIDGE_ADMIN_BEARER_TOKEN")]
    pub admin_bearer_token: Option<String>,

    /// Base URL of the Matrix homeserver's Client-Server API.
    #[arg(long, env = "BRIDGE_HOMESERVER_URL")]
    pub homeserver_url: String,

    /// Homeserver's server_name, used to build full mxids from localparts.
    #[arg(long, env = "BRIDGE_SERVER_NAME")]
    pub server_name: String,

    /// Localpart of the bridge's own admin account, used for room creation and invites.
    #[arg(long, env = "BRIDGE_ADMIN_LOCALPART")]
    pub admin_localpart: String,

    /// Password for the admin account.
    #[arg(long, env = "BRIDGE_ADMIN_PASSWORD")]
    pub admin_password: String,

    /// Path to the sqlite database file.
    #[arg(long, default_value = "./bridge.sqlite3", env = "BRIDGE_DATABASE_PATH")]
    pub database_path: PathBuf,

    /// Base URL of the agent runtime the Connector dispatches to.
    #[arg(long, env = "BRIDGE_AGENT_RUNTIME_URL")]
    pub agent_runtime_url: String,

    /// Bearer token for authenticating against the agent runtime.
    #[arg(long, env = "BRIDGE_AGENT_RUNTIME_TOKEN")]
    pub agent_runtime_token: Option<String>,

    /// Display name of the shared Matrix space used to validate agent rooms.
    #[arg(long, default_value = "Agents", env = "BRIDGE_AGENTS_SPACE_NAME")]
    pub agents_space_name: String,

    /// Reconciler poll interval in milliseconds.
    #[arg(long, default_value_t = 500, env = "BRIDGE_RECONCILE_INTERVAL_MS")]
    pub reconcile_interval_ms: u64,

    /// Long-poll timeout passed to `/sync` requests, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "BRIDGE_SYNC_TIMEOUT_MS")]
    pub sync_timeout_ms: u64,

    /// Whether a cold-started identity drops pre-existing room history instead of replaying it.
    #[arg(long, default_value_t = true, env = "BRIDGE_COLD_START_DROP_HISTORY")]
    pub cold_start_drop_history: bool,

    /// Webhook signature verification mode.
    #[arg(long, value_enum, default_value_t = WebhookVerifyMode::Enforce, env = "BRIDGE_WEBHOOK_VERIFY")]
    pub webhook_verify: WebhookVerifyMode,

    /// Shared secret used to verify inbound webhook HMAC signatures.
    #[arg(long, env = "BRIDGE_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    /// Time-to-live, in seconds, for the Delivery Arbiter's in-flight dedup table.
    #[arg(long, default_value_t = 300, env = "BRIDGE_INFLIGHT_TTL_SECONDS")]
    pub inflight_ttl_seconds: u64,

    /// Maximum concurrent sends the Connector allows per conversation.
    #[arg(long, default_value_t = 1, env = "BRIDGE_CONNECTOR_MAX_CONCURRENT_PER_CONVERSATION")]
    pub connector_max_concurrent_per_conversation: usize,

    /// Maximum retry attempts before surfacing a transient upstream failure.
    #[arg(long, default_value_t = 5, env = "BRIDGE_RATE_LIMIT_MAX_RETRIES")]
    pub rate_limit_max_retries: u32,

    /// `tracing_subscriber::EnvFilter` directive string. Overridden by `RUST_LOG` if set.
    #[arg(long, default_value = "info", env = "BRIDGE_LOG_FILTER")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WebhookVerifyMode {
    Enforce,
    Bypass,
}

impl BridgeConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn inflight_ttl(&self) -> Duration {
        Duration::from_secs(self.inflight_ttl_seconds)
    }

    pub fn webhook_verification_enabled(&self) -> bool {
        matches!(self.webhook_verify, WebhookVerifyMode::Enforce)
    }
}
