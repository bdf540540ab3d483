// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Peer Bridge registry: tracks sibling bridge instances a peer-originated
//! message might have come from. TTL-driven, like the Delivery Arbiter's
//! in-flight table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRegistration {
    pub session_id: String,
    pub directory: String,
    pub listen_port: u16,
    pub rooms: Vec<String>,
}

struct Entry {
    registration: PeerRegistration,
    last_seen: Instant,
}

/// Registry of known peer bridge sessions, evicted after `ttl` of silence.
pub struct PeerRegistry {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl PeerRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    pub async fn touch(&self, registration: PeerRegistration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            registration.session_id.clone(),
            Entry { registration, last_seen: Instant::now() },
        );
    }

    pub async fn active(&self) -> Vec<PeerRegistration> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| now.duration_since(e.last_seen) < self.ttl);
        entries.values().map(|e| e.registration.clone()).collect()
    }

    pub async fn evict(&self, session_id: &str) {
        self.entries.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registrations_expire_after_ttl() {
        let registry = PeerRegistry::new(Duration::from_millis(10));
        registry
            .touch(PeerRegistration {
                session_id: "s1".into(),
                directory: "/tmp".into(),
                listen_port: 9000,
                rooms: vec!["!a:x".into()],
            })
            .await;
        assert_eq!(registry.active().await.len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.active().await.is_empty());
    }
}
