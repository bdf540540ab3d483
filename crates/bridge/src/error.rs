// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds for the bridge, per the error-handling taxonomy.
///
/// These are closed *kinds*, not a generic escape hatch: the Homeserver
/// Gateway and Agent Runtime Connector classify low-level transport failures
/// into one of these before anything downstream sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeError {
    /// Uniqueness violation on mxid/room/localpart.
    IdentityConflict { detail: String },
    /// Bearer credential rejected by the homeserver; recovered via re-login.
    AuthExpired,
    /// Homeserver or agent runtime asked us to slow down.
    RateLimited { retry_after_ms: u64 },
    /// Operation refused; no retry.
    Forbidden { detail: String },
    /// Target (room, event, session) does not exist.
    NotFound { detail: String },
    /// Exhausted retry budget against an upstream; caller decides fate.
    TransientUpstream { detail: String },
    /// Caller-supplied input was invalid; never retried.
    MalformedInput { detail: String },
    /// Persisted-store corruption or invariant violation; component stops.
    Fatal { detail: String },
    /// Agent runtime refused a second concurrent send for one conversation.
    ConversationBusy { conversation_id: String },
    /// Requested session/agent/room is unknown to this bridge instance.
    SessionNotFound,
    /// Caller is not authorized to invoke this operation.
    Unauthorized,
}

impl BridgeError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::IdentityConflict { .. } => StatusCode::CONFLICT,
            Self::AuthExpired => StatusCode::BAD_GATEWAY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } | Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::TransientUpstream { .. } => StatusCode::BAD_GATEWAY,
            Self::MalformedInput { .. } => StatusCode::BAD_REQUEST,
            Self::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConversationBusy { .. } => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::IdentityConflict { .. } => "IDENTITY_CONFLICT",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::TransientUpstream { .. } => "TRANSIENT_UPSTREAM",
            Self::MalformedInput { .. } => "MALFORMED_INPUT",
            Self::Fatal { .. } => "FATAL",
            Self::ConversationBusy { .. } => "CONVERSATION_BUSY",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Whether the caller should retry this operation after a local delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::TransientUpstream { .. } | Self::AuthExpired)
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        let body = ErrorResponse {
            error: ErrorBody { code: self.code().to_owned(), message: self.to_string() },
        };
        (self.http_status(), Json(body))
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentityConflict { detail } => write!(f, "identity conflict: {detail}"),
            Self::AuthExpired => write!(f, "credential expired"),
            Self::RateLimited { retry_after_ms } => {
                write!(f, "rate limited, retry after {retry_after_ms}ms")
            }
            Self::Forbidden { detail } => write!(f, "forbidden: {detail}"),
            Self::NotFound { detail } => write!(f, "not found: {detail}"),
            Self::TransientUpstream { detail } => write!(f, "transient upstream error: {detail}"),
            Self::MalformedInput { detail } => write!(f, "malformed input: {detail}"),
            Self::Fatal { detail } => write!(f, "fatal: {detail}"),
            Self::ConversationBusy { conversation_id } => {
                write!(f, "conversation {conversation_id} busy")
            }
            Self::SessionNotFound => write!(f, "session not found"),
            Self::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl axum::response::IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        self.to_http_response().into_response()
    }
}

/// Top-level error response envelope returned by REST handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
