// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;
use crate::gateway::SyncResult;

/// Thin typed client over the Matrix Client-Server API v3.
///
/// One `HomeserverGateway` is shared across every identity the bridge
/// manages; per-call bearer tokens are passed explicitly rather than baked
/// into the client, since each identity authenticates as itself.
#[derive(Clone)]
pub struct HomeserverGateway {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RegisterBody<'a> {
    username: &'a str,
    password: &'a str,
    auth: RegisterAuth,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RegisterAuth {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub access_token: String,
}

/// Shape of a Matrix Client-Server API error body: `{"errcode": "M_...", "error": "..."}`.
#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
    errcode: Option<String>,
    #[allow(dead_code)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    identifier: LoginIdentifier<'a>,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginIdentifier<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct WhoamiResponse {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
struct CreateRoomBody<'a> {
    name: &'a str,
    topic: &'a str,
    visibility: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    initial_state: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    invite: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendEventResponse {
    pub event_id: String,
}

impl HomeserverGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BridgeError::Fatal { detail: format!("failed to build http client: {e}") })?;
        Ok(Self { base_url: base_url.into(), client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn register(
        &self,
        localpart: &str,
        password: &str,
        registration_token: Option<&str>,
    ) -> Result<(String, String), BridgeError> {
        let body = RegisterBody {
            username: localpart,
            password,
            auth: RegisterAuth { kind: "m.login.dummy" },
            registration_token,
        };
        let resp = self
            .client
            .post(self.url("/_matrix/client/v3/register"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        // A 400 here can mean the localpart is already registered
        // (`M_USER_IN_USE`), which the caller needs to distinguish from a
        // genuinely malformed request so it can fall back to logging in as
        // that user instead of treating registration as fatally failed.
        if resp.status() == StatusCode::BAD_REQUEST {
            let status = resp.status();
            let body = resp
                .bytes()
                .await
                .map_err(|e| BridgeError::TransientUpstream { detail: format!("failed reading response body: {e}") })?;
            if let Ok(err_body) = serde_json::from_slice::<MatrixErrorBody>(&body) {
                if err_body.errcode.as_deref() == Some("M_USER_IN_USE") {
                    return Err(BridgeError::IdentityConflict {
                        detail: format!("localpart {localpart} already registered"),
                    });
                }
            }
            return Err(BridgeError::Fatal { detail: format!("homeserver register rejected: {status}") });
        }

        let parsed: RegisterResponse = classify_and_decode(resp).await?;
        Ok((parsed.user_id, parsed.access_token))
    }

    pub async fn login(&self, localpart: &str, password: &str) -> Result<String, BridgeError> {
        let body = LoginBody {
            kind: "m.login.password",
            identifier: LoginIdentifier { kind: "m.id.user", user: localpart },
            password,
        };
        let resp = self
            .client
            .post(self.url("/_matrix/client/v3/login"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: LoginResponse = classify_and_decode(resp).await?;
        Ok(parsed.access_token)
    }

    pub async fn whoami(&self, token: &str) -> Result<String, BridgeError> {
        let resp = self
            .client
            .get(self.url("/_matrix/client/v3/account/whoami"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: WhoamiResponse = classify_and_decode(resp).await?;
        Ok(parsed.user_id)
    }

    pub async fn set_display_name(
        &self,
        user_id: &str,
        token: &str,
        display_name: &str,
    ) -> Result<(), BridgeError> {
        let resp = self
            .client
            .put(self.url(&format!("/_matrix/client/v3/profile/{user_id}/displayname")))
            .bearer_auth(token)
            .json(&serde_json::json!({ "displayname": display_name }))
            .send()
            .await
            .map_err(transport_error)?;
        classify_empty(resp).await
    }

    pub async fn create_room(
        &self,
        token: &str,
        name: &str,
        topic: &str,
        visibility: &str,
        initial_state: Vec<Value>,
        invitees: Vec<String>,
    ) -> Result<String, BridgeError> {
        let body = CreateRoomBody { name, topic, visibility, initial_state, invite: invitees };
        let resp = self
            .client
            .post(self.url("/_matrix/client/v3/createRoom"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: CreateRoomResponse = classify_and_decode(resp).await?;
        Ok(parsed.room_id)
    }

    pub async fn join(&self, token: &str, room_id_or_alias: &str) -> Result<String, BridgeError> {
        let resp = self
            .client
            .post(self.url(&format!("/_matrix/client/v3/join/{room_id_or_alias}")))
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(transport_error)?;
        #[derive(Deserialize)]
        struct JoinResponse {
            room_id: String,
        }
        let parsed: JoinResponse = classify_and_decode(resp).await?;
        Ok(parsed.room_id)
    }

    pub async fn invite(
        &self,
        room_id: &str,
        invitee: &str,
        admin_token: &str,
    ) -> Result<(), BridgeError> {
        let resp = self
            .client
            .post(self.url(&format!("/_matrix/client/v3/rooms/{room_id}/invite")))
            .bearer_auth(admin_token)
            .json(&serde_json::json!({ "user_id": invitee }))
            .send()
            .await
            .map_err(transport_error)?;
        classify_empty(resp).await
    }

    pub async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        token: &str,
    ) -> Result<String, BridgeError> {
        let txn_id = uuid::Uuid::new_v4();
        let resp = self
            .client
            .put(self.url(&format!("/_matrix/client/v3/rooms/{room_id}/send/{event_type}/{txn_id}")))
            .bearer_auth(token)
            .json(content)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: SendEventResponse = classify_and_decode(resp).await?;
        Ok(parsed.event_id)
    }

    /// Set a room state event at `state_key` (empty string for the
    /// unkeyed default), e.g. `m.room.name` or `m.space.child`.
    pub async fn set_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
        token: &str,
    ) -> Result<String, BridgeError> {
        let resp = self
            .client
            .put(self.url(&format!("/_matrix/client/v3/rooms/{room_id}/state/{event_type}/{state_key}")))
            .bearer_auth(token)
            .json(content)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: SendEventResponse = classify_and_decode(resp).await?;
        Ok(parsed.event_id)
    }

    pub async fn get_state(
        &self,
        room_id: &str,
        token: &str,
    ) -> Result<Vec<Value>, BridgeError> {
        let resp = self
            .client
            .get(self.url(&format!("/_matrix/client/v3/rooms/{room_id}/state")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        classify_and_decode(resp).await
    }

    pub async fn get_messages(
        &self,
        room_id: &str,
        token: &str,
        direction: &str,
        limit: u32,
    ) -> Result<Value, BridgeError> {
        let resp = self
            .client
            .get(self.url(&format!("/_matrix/client/v3/rooms/{room_id}/messages")))
            .bearer_auth(token)
            .query(&[("dir", direction), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(transport_error)?;
        classify_and_decode(resp).await
    }

    pub async fn sync(
        &self,
        token: &str,
        since: Option<&str>,
        filter: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncResult, BridgeError> {
        let mut query = vec![("timeout", timeout.as_millis().to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_owned()));
        }
        if let Some(filter) = filter {
            query.push(("filter", filter.to_owned()));
        }
        let resp = self
            .client
            .get(self.url("/_matrix/client/v3/sync"))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: Value = classify_and_decode(resp).await?;
        let next_batch = parsed
            .get("next_batch")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::TransientUpstream { detail: "sync response missing next_batch".into() })?
            .to_owned();
        let events = flatten_sync_events(&parsed);
        Ok(SyncResult { events, next_batch })
    }
}

/// Extracts room-scoped timeline events from a raw `/sync` response body.
fn flatten_sync_events(body: &Value) -> Vec<Value> {
    let mut events = Vec::new();
    if let Some(joined) = body.pointer("/rooms/join").and_then(Value::as_object) {
        for (room_id, room) in joined {
            if let Some(timeline) = room.pointer("/timeline/events").and_then(Value::as_array) {
                for event in timeline {
                    let mut event = event.clone();
                    if let Some(obj) = event.as_object_mut() {
                        obj.insert("room_id".to_owned(), Value::String(room_id.clone()));
                    }
                    events.push(event);
                }
            }
        }
    }
    if let Some(invited) = body.pointer("/rooms/invite").and_then(Value::as_object) {
        for (room_id, room) in invited {
            if let Some(stripped) = room.pointer("/invite_state/events").and_then(Value::as_array) {
                for event in stripped {
                    let mut event = event.clone();
                    if let Some(obj) = event.as_object_mut() {
                        obj.insert("room_id".to_owned(), Value::String(room_id.clone()));
                    }
                    events.push(event);
                }
            }
        }
    }
    events
}

fn transport_error(e: reqwest::Error) -> BridgeError {
    if e.is_timeout() {
        BridgeError::TransientUpstream { detail: format!("homeserver request timed out: {e}") }
    } else {
        BridgeError::TransientUpstream { detail: format!("homeserver request failed: {e}") }
    }
}

async fn classify_empty(resp: reqwest::Response) -> Result<(), BridgeError> {
    classify_status(&resp)?;
    Ok(())
}

async fn classify_and_decode<T: for<'de> Deserialize<'de>>(
    resp: reqwest::Response,
) -> Result<T, BridgeError> {
    classify_status(&resp)?;
    let retry_after = resp
        .headers()
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| BridgeError::TransientUpstream { detail: format!("failed reading response body: {e}") })?;
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BridgeError::RateLimited { retry_after_ms: retry_after.unwrap_or(1000) });
    }
    serde_json::from_slice(&body).map_err(|e| BridgeError::TransientUpstream {
        detail: format!("failed to decode homeserver response: {e}"),
    })
}

fn classify_status(resp: &reqwest::Response) -> Result<(), BridgeError> {
    match resp.status() {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED => Err(BridgeError::AuthExpired),
        StatusCode::FORBIDDEN => Err(BridgeError::Forbidden { detail: "homeserver refused the request".into() }),
        StatusCode::NOT_FOUND => Err(BridgeError::NotFound { detail: "homeserver resource not found".into() }),
        StatusCode::TOO_MANY_REQUESTS => Err(BridgeError::RateLimited { retry_after_ms: 1000 }),
        s if s.is_server_error() => {
            Err(BridgeError::TransientUpstream { detail: format!("homeserver returned {s}") })
        }
        s => Err(BridgeError::Fatal { detail: format!("unexpected homeserver status {s}") }),
    }
}
