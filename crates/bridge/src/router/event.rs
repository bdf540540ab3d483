// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A homeserver timeline event, reshaped from the raw JSON the gateway
/// returns into the variants the classifier actually reasons about.
///
/// `Unknown` is a real, counted variant, not a silent catch-all: anything
/// that doesn't parse as one of the known message-of-interest shapes lands
/// here and is dropped with a counter bump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingEvent {
    Message {
        event_id: String,
        room_id: String,
        sender: String,
        origin_ts: i64,
        content: Value,
    },
    Reaction {
        event_id: String,
        room_id: String,
        sender: String,
        origin_ts: i64,
        relates_to_event_id: String,
    },
    StateChange {
        event_id: String,
        room_id: String,
        sender: String,
        origin_ts: i64,
        state_key: String,
    },
    Unknown,
}

impl IncomingEvent {
    pub fn from_raw(value: &Value) -> Self {
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let room_id = value.get("room_id").and_then(Value::as_str).unwrap_or_default().to_owned();
        let sender = value.get("sender").and_then(Value::as_str).unwrap_or_default().to_owned();
        let event_id = value.get("event_id").and_then(Value::as_str).unwrap_or_default().to_owned();
        let origin_ts = value.get("origin_ts").and_then(Value::as_i64).unwrap_or(0);
        let state_key = value.get("state_key").and_then(Value::as_str);

        match (event_type, state_key) {
            ("m.room.message", None) => IncomingEvent::Message {
                event_id,
                room_id,
                sender,
                origin_ts,
                content: value.get("content").cloned().unwrap_or(Value::Null),
            },
            ("m.reaction", None) => {
                let relates_to_event_id = value
                    .pointer("/content/m.relates_to/event_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                IncomingEvent::Reaction { event_id, room_id, sender, origin_ts, relates_to_event_id }
            }
            (_, Some(state_key)) => {
                IncomingEvent::StateChange { event_id, room_id, sender, origin_ts, state_key: state_key.to_owned() }
            }
            _ => IncomingEvent::Unknown,
        }
    }

    pub fn origin_ts(&self) -> Option<i64> {
        match self {
            IncomingEvent::Message { origin_ts, .. }
            | IncomingEvent::Reaction { origin_ts, .. }
            | IncomingEvent::StateChange { origin_ts, .. } => Some(*origin_ts),
            IncomingEvent::Unknown => None,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            IncomingEvent::Message { room_id, .. }
            | IncomingEvent::Reaction { room_id, .. }
            | IncomingEvent::StateChange { room_id, .. } => Some(room_id),
            IncomingEvent::Unknown => None,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            IncomingEvent::Message { sender, .. }
            | IncomingEvent::Reaction { sender, .. }
            | IncomingEvent::StateChange { sender, .. } => Some(sender),
            IncomingEvent::Unknown => None,
        }
    }
}

/// The two independent bridge-origin suppression markers. Either is
/// sufficient to mark content as looped and suppress re-forwarding.
const BRIDGE_ORIGINATED_MARKER: &str = "bridge_originated";
const HISTORICAL_REPLAY_MARKER: &str = "letta_historical";

fn carries_bridge_marker(content: &Value) -> bool {
    content.get(BRIDGE_ORIGINATED_MARKER).and_then(Value::as_bool).unwrap_or(false)
        || content.get(HISTORICAL_REPLAY_MARKER).and_then(Value::as_bool).unwrap_or(false)
}

/// Result of classifying one [`IncomingEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationOutcome {
    /// Forward to the owning agent's runtime, with the conversation the
    /// event should be attached to.
    ForwardToRuntime { owning_agent_id: String },
    /// Drop silently (not of interest, cold-start replay, self-echo, or loop).
    Drop(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NotMessageType,
    BeforeColdStartWatermark,
    SelfEcho,
    LoopMarker,
    UnknownEventShape,
    NoOwningRoom,
}

/// Minimal room-ownership lookup the classifier needs. Implemented by the
/// Identity Store's `get_by_room_id` in production; a plain map in tests.
pub trait RoomOwnerLookup {
    fn owning_agent(&self, room_id: &str) -> Option<(String, String)>;
}

/// Apply the ordered decision list: message-type filter, cold-start
/// watermark, owning-room lookup, self-echo drop, bridge-marker/loop drop,
/// then forward (inter-agent or human) to the owning agent's runtime.
pub fn classify(
    event: &IncomingEvent,
    cold_start_watermark: DateTime<Utc>,
    lookup: &impl RoomOwnerLookup,
) -> ClassificationOutcome {
    let IncomingEvent::Message { room_id, sender, origin_ts, content, .. } = event else {
        return ClassificationOutcome::Drop(DropReason::NotMessageType);
    };

    if *origin_ts < cold_start_watermark.timestamp_millis() {
        return ClassificationOutcome::Drop(DropReason::BeforeColdStartWatermark);
    }

    let Some((owning_agent_id, owning_mxid)) = lookup.owning_agent(room_id) else {
        return ClassificationOutcome::Drop(DropReason::NoOwningRoom);
    };

    if sender == &owning_mxid {
        return ClassificationOutcome::Drop(DropReason::SelfEcho);
    }

    if is_known_agent_mxid(sender, lookup) && carries_bridge_marker(content) {
        return ClassificationOutcome::Drop(DropReason::LoopMarker);
    }

    ClassificationOutcome::ForwardToRuntime { owning_agent_id }
}

fn is_known_agent_mxid(sender: &str, lookup: &impl RoomOwnerLookup) -> bool {
    // A sender is a "known agent" if it owns *some* room in the store; the
    // classifier only needs this to decide whether the loop-marker check
    // applies, not which agent it is.
    lookup.owning_agent(sender).is_some() || sender.starts_with("@agent_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeLookup(HashMap<String, (String, String)>);

    impl RoomOwnerLookup for FakeLookup {
        fn owning_agent(&self, room_id: &str) -> Option<(String, String)> {
            self.0.get(room_id).cloned()
        }
    }

    fn message(sender: &str, room_id: &str, origin_ts: i64, content: Value) -> IncomingEvent {
        IncomingEvent::Message {
            event_id: "$evt".into(),
            room_id: room_id.into(),
            sender: sender.into(),
            origin_ts,
            content,
        }
    }

    #[test]
    fn drops_non_message_events() {
        let lookup = FakeLookup(HashMap::new());
        let outcome = classify(&IncomingEvent::Unknown, Utc::now(), &lookup);
        assert_eq!(outcome, ClassificationOutcome::Drop(DropReason::NotMessageType));
    }

    #[test]
    fn drops_self_echo() {
        let mut rooms = HashMap::new();
        rooms.insert("!room:x".to_owned(), ("agent-1".to_owned(), "@agent_1:x".to_owned()));
        let lookup = FakeLookup(rooms);
        let event = message("@agent_1:x", "!room:x", 1_000, serde_json::json!({"body": "hi"}));
        let outcome = classify(&event, DateTime::from_timestamp_millis(0).unwrap(), &lookup);
        assert_eq!(outcome, ClassificationOutcome::Drop(DropReason::SelfEcho));
    }

    #[test]
    fn drops_bridge_marked_loop_from_known_agent() {
        let mut rooms = HashMap::new();
        rooms.insert("!room:x".to_owned(), ("agent-xyz".to_owned(), "@agent_xyz:x".to_owned()));
        rooms.insert("!other:x".to_owned(), ("agent-abc".to_owned(), "@agent_abc:x".to_owned()));
        let lookup = FakeLookup(rooms);
        let event = message(
            "@agent_abc:x",
            "!room:x",
            1_000,
            serde_json::json!({"body": "hi", "bridge_originated": true}),
        );
        let outcome = classify(&event, DateTime::from_timestamp_millis(0).unwrap(), &lookup);
        assert_eq!(outcome, ClassificationOutcome::Drop(DropReason::LoopMarker));
    }

    #[test]
    fn forwards_plain_human_typed_message_from_agent_sender() {
        let mut rooms = HashMap::new();
        rooms.insert("!room:x".to_owned(), ("agent-xyz".to_owned(), "@agent_xyz:x".to_owned()));
        rooms.insert("!other:x".to_owned(), ("agent-abc".to_owned(), "@agent_abc:x".to_owned()));
        let lookup = FakeLookup(rooms);
        let event = message("@agent_abc:x", "!room:x", 1_000, serde_json::json!({"body": "hi"}));
        let outcome = classify(&event, DateTime::from_timestamp_millis(0).unwrap(), &lookup);
        assert_eq!(
            outcome,
            ClassificationOutcome::ForwardToRuntime { owning_agent_id: "agent-xyz".to_owned() }
        );
    }

    #[test]
    fn drops_events_before_cold_start_watermark() {
        let mut rooms = HashMap::new();
        rooms.insert("!room:x".to_owned(), ("agent-1".to_owned(), "@agent_1:x".to_owned()));
        let lookup = FakeLookup(rooms);
        let event = message("@alice:x", "!room:x", 500, serde_json::json!({"body": "hi"}));
        let watermark = DateTime::from_timestamp_millis(1_000).unwrap();
        let outcome = classify(&event, watermark, &lookup);
        assert_eq!(outcome, ClassificationOutcome::Drop(DropReason::BeforeColdStartWatermark));
    }

    #[test]
    fn forwards_human_message() {
        let mut rooms = HashMap::new();
        rooms.insert("!room:x".to_owned(), ("agent-1".to_owned(), "@agent_1:x".to_owned()));
        let lookup = FakeLookup(rooms);
        let event = message("@alice:x", "!room:x", 1_000, serde_json::json!({"body": "hello"}));
        let outcome = classify(&event, DateTime::from_timestamp_millis(0).unwrap(), &lookup);
        assert_eq!(
            outcome,
            ClassificationOutcome::ForwardToRuntime { owning_agent_id: "agent-1".to_owned() }
        );
    }
}
