// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::BridgeError;
use crate::BridgeState;

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a Bearer token from HTTP headers.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), BridgeError> {
    let expected = match expected {
        Some(tok) => tok,
        None => return Ok(()),
    };

    let header =
        headers.get("authorization").and_then(|v| v.to_str().ok()).ok_or(BridgeError::Unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or(BridgeError::Unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(BridgeError::Unauthorized)
    }
}

/// Axum middleware that enforces Bearer token authentication.
///
/// Exempt: `/health` and the webhook ingress path, which verifies its own
/// HMAC signature instead of a bearer token.
pub async fn auth_layer(
    state: State<Arc<BridgeState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();

    if path == "/health" || path == "/webhooks/agent-response" {
        return next.run(req).await;
    }

    if let Err(err) = validate_bearer(req.headers(), state.admin_bearer_token.as_deref()) {
        return err.into_response();
    }

    next.run(req).await
}
