// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Delivery Arbiter: guarantees at most one Matrix send per logical
//! `(agent_id, run_id_or_event_id)` key, regardless of how many ingress
//! paths (Connector stream termination, Webhook Ingress, peer bridge)
//! observe the same logical completion.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Status of a tracked in-flight delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent { event_id: String },
    Suppressed,
    Failed,
}

struct InFlightEntry {
    status: DeliveryStatus,
    expires_at: Instant,
}

/// TTL-bounded dedup table keyed on the logical delivery key. Entries expire
/// after a bounded TTL (default 5 minutes) so the table doesn't grow
/// unbounded across a long-running process.
pub struct DeliveryArbiter {
    ttl: Duration,
    entries: Mutex<HashMap<String, InFlightEntry>>,
}

/// Outcome of attempting to claim a delivery slot.
pub enum ClaimOutcome {
    /// Caller won the race; proceed to send, then call `record_sent`.
    Claimed,
    /// Another submission already claimed (or completed) this key.
    AlreadyClaimed(DeliveryStatus),
}

impl DeliveryArbiter {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    fn logical_key(agent_id: &str, run_id_or_event_id: &str) -> String {
        format!("{agent_id}:{run_id_or_event_id}")
    }

    /// Attempt to claim the send slot for `(agent_id, run_id_or_event_id)`.
    /// The critical section never suspends: expiry and the insert happen
    /// under a single short-held lock.
    pub async fn try_claim(&self, agent_id: &str, run_id_or_event_id: &str) -> ClaimOutcome {
        let key = Self::logical_key(agent_id, run_id_or_event_id);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries, now);

        if let Some(existing) = entries.get(&key) {
            return ClaimOutcome::AlreadyClaimed(existing.status.clone());
        }

        entries.insert(key, InFlightEntry { status: DeliveryStatus::Pending, expires_at: now + self.ttl });
        ClaimOutcome::Claimed
    }

    pub async fn record_sent(&self, agent_id: &str, run_id_or_event_id: &str, event_id: String) {
        let key = Self::logical_key(agent_id, run_id_or_event_id);
        let mut entries = self.entries.lock().await;
        let expires_at = Instant::now() + self.ttl;
        entries.insert(key, InFlightEntry { status: DeliveryStatus::Sent { event_id }, expires_at });
    }

    pub async fn record_failed(&self, agent_id: &str, run_id_or_event_id: &str) {
        let key = Self::logical_key(agent_id, run_id_or_event_id);
        let mut entries = self.entries.lock().await;
        let expires_at = Instant::now() + self.ttl;
        entries.insert(key, InFlightEntry { status: DeliveryStatus::Failed, expires_at });
    }
}

fn evict_expired(entries: &mut HashMap<String, InFlightEntry>, now: Instant) {
    entries.retain(|_, entry| entry.expires_at > now);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claim_for_same_key_is_suppressed() {
        let arbiter = DeliveryArbiter::new(Duration::from_secs(300));
        assert!(matches!(arbiter.try_claim("agent-1", "run-1").await, ClaimOutcome::Claimed));
        arbiter.record_sent("agent-1", "run-1", "$evt:x".to_owned()).await;

        match arbiter.try_claim("agent-1", "run-1").await {
            ClaimOutcome::AlreadyClaimed(DeliveryStatus::Sent { event_id }) => {
                assert_eq!(event_id, "$evt:x");
            }
            other => panic!("expected AlreadyClaimed(Sent), got non-matching outcome: {other:?}", other = debug(&other)),
        }
    }

    fn debug(outcome: &ClaimOutcome) -> &'static str {
        match outcome {
            ClaimOutcome::Claimed => "Claimed",
            ClaimOutcome::AlreadyClaimed(_) => "AlreadyClaimed",
        }
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let arbiter = DeliveryArbiter::new(Duration::from_secs(300));
        assert!(matches!(arbiter.try_claim("agent-1", "run-1").await, ClaimOutcome::Claimed));
        assert!(matches!(arbiter.try_claim("agent-1", "run-2").await, ClaimOutcome::Claimed));
    }
}
