// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Homeserver Gateway: a thin, typed `reqwest` wrapper over the Matrix
//! Client-Server API v3, with explicit failure classification.
//!
//! Deliberately not a full Matrix SDK client per identity — a gateway
//! instance holds a single `reqwest::Client` (connection-pooled by
//! `reqwest` itself) shared across every bridged identity, since hundreds
//! of concurrently active identities would make a heavyweight per-identity
//! SDK client prohibitive.

pub mod client;
pub mod pool;

pub use client::HomeserverGateway;
pub use pool::ClientPool;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomVisibility(pub String);

impl RoomVisibility {
    pub fn private() -> Self {
        Self("private".to_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub events: Vec<serde_json::Value>,
    pub next_batch: String,
}
