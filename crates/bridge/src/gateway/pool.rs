// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client Pool: caches an authenticated bearer token per identity and
//! renews it on `AuthExpired`, serializing refreshes per identity so two
//! concurrent callers never race each other into a double login.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::error::BridgeError;
use crate::gateway::HomeserverGateway;

struct CachedSession {
    token: String,
    refresh_lock: Arc<Mutex<()>>,
}

/// Holds one cached bearer token per `agent_id`, re-logging in on demand.
pub struct ClientPool {
    gateway: HomeserverGateway,
    sessions: RwLock<HashMap<String, CachedSession>>,
}

impl ClientPool {
    pub fn new(gateway: HomeserverGateway) -> Self {
        Self { gateway, sessions: RwLock::new(HashMap::new()) }
    }

    /// Returns the cached token for `agent_id`, logging in if absent.
    pub async fn token_for(
        &self,
        agent_id: &str,
        localpart: &str,
        password_seed: &str,
    ) -> Result<String, BridgeError> {
        if let Some(token) = self.cached_token(agent_id).await {
            return Ok(token);
        }
        self.renew(agent_id, localpart, password_seed).await
    }

    /// Forces a fresh login for `agent_id`, serialized so concurrent callers
    /// observing `AuthExpired` at once collapse into a single re-login.
    pub async fn renew(
        &self,
        agent_id: &str,
        localpart: &str,
        password_seed: &str,
    ) -> Result<String, BridgeError> {
        let refresh_lock = self.refresh_lock_for(agent_id).await;
        let _guard = refresh_lock.lock().await;

        if let Some(token) = self.cached_token(agent_id).await {
            return Ok(token);
        }

        let token = login_with_backoff(&self.gateway, localpart, password_seed).await?;
        self.sessions.write().await.insert(
            agent_id.to_owned(),
            CachedSession { token: token.clone(), refresh_lock },
        );
        Ok(token)
    }

    pub async fn evict(&self, agent_id: &str) {
        self.sessions.write().await.remove(agent_id);
    }

    async fn cached_token(&self, agent_id: &str) -> Option<String> {
        self.sessions.read().await.get(agent_id).map(|s| s.token.clone())
    }

    async fn refresh_lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        if let Some(session) = self.sessions.read().await.get(agent_id) {
            return Arc::clone(&session.refresh_lock);
        }
        Arc::new(Mutex::new(()))
    }
}

/// Exponential backoff login, matching the bridge's 1s/2s/4s retry policy
/// for recoverable upstream failures, capped at three attempts.
async fn login_with_backoff(
    gateway: &HomeserverGateway,
    localpart: &str,
    password_seed: &str,
) -> Result<String, BridgeError> {
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        match gateway.login(localpart, password_seed).await {
            Ok(token) => return Ok(token),
            Err(e) if e.is_retryable() && attempt < 2 => {
                attempt += 1;
                tracing::warn!(localpart, attempt, "homeserver login failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_for_caches_across_calls() {
        let gateway = HomeserverGateway::new("http://localhost:0").expect("build gateway");
        let pool = ClientPool::new(gateway);
        pool.sessions.write().await.insert(
            "agent-1".to_owned(),
            CachedSession { token: "cached-token".to_owned(), refresh_lock: Arc::new(Mutex::new(())) },
        );
        let token = pool.token_for("agent-1", "agent_1", "seed").await.expect("cached token");
        assert_eq!(token, "cached-token");
    }
}
