// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health tracking: atomic counters fed by the Reconciler, Sync Supervisor,
//! and Delivery Arbiter paths, reduced into the `GET /health` status object.

use std::sync::atomic::{AtomicU64, Ordering};

/// Consecutive reconciler-tick failures at or above this count mark the
/// bridge `unhealthy` rather than merely `degraded`.
const UNHEALTHY_RECONCILE_FAILURES: u64 = 3;

#[derive(Debug, Default)]
pub struct HealthTracker {
    provisioning_failures: AtomicU64,
    sync_failures: AtomicU64,
    delivery_failures: AtomicU64,
    consecutive_reconcile_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub status: Status,
    pub provisioning_failures: u64,
    pub sync_failures: u64,
    pub delivery_failures: u64,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconcile_success(&self) {
        self.consecutive_reconcile_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_reconcile_failure(&self) {
        self.consecutive_reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provisioning_failure(&self) {
        self.provisioning_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let consecutive_reconcile_failures = self.consecutive_reconcile_failures.load(Ordering::Relaxed);
        let provisioning_failures = self.provisioning_failures.load(Ordering::Relaxed);
        let sync_failures = self.sync_failures.load(Ordering::Relaxed);
        let delivery_failures = self.delivery_failures.load(Ordering::Relaxed);

        let status = if consecutive_reconcile_failures >= UNHEALTHY_RECONCILE_FAILURES {
            Status::Unhealthy
        } else if consecutive_reconcile_failures > 0 || provisioning_failures > 0 || sync_failures > 0 || delivery_failures > 0 {
            Status::Degraded
        } else {
            Status::Healthy
        };

        HealthSnapshot { status, provisioning_failures, sync_failures, delivery_failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.snapshot().status, Status::Healthy);
    }

    #[test]
    fn any_single_failure_counter_degrades() {
        let tracker = HealthTracker::new();
        tracker.record_provisioning_failure();
        assert_eq!(tracker.snapshot().status, Status::Degraded);
    }

    #[test]
    fn repeated_reconcile_failures_become_unhealthy() {
        let tracker = HealthTracker::new();
        for _ in 0..UNHEALTHY_RECONCILE_FAILURES {
            tracker.record_reconcile_failure();
        }
        assert_eq!(tracker.snapshot().status, Status::Unhealthy);
    }

    #[test]
    fn a_success_resets_the_reconcile_streak() {
        let tracker = HealthTracker::new();
        tracker.record_reconcile_failure();
        tracker.record_reconcile_failure();
        tracker.record_reconcile_success();
        assert_eq!(tracker.snapshot().status, Status::Healthy);
    }
}
