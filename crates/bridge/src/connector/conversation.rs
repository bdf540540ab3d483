// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::error::BridgeError;
use crate::storage::Db;

/// Durable `(room_id, agent_id, user_scope) -> conversation_id` binding,
/// isolating agent-runtime context per room. Owned by the Connector.
///
/// Concurrent `get_or_create` calls for the same tuple converge on the
/// first writer's `conversation_id`: the insert is a no-op on conflict, and
/// the caller re-reads whatever row won the race.
pub struct ConversationStore<'a> {
    db: &'a Db,
}

impl<'a> ConversationStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn get(&self, room_id: &str, agent_id: &str, user_scope: &str) -> Result<Option<String>, BridgeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT conversation_id FROM conversation_bindings
                 WHERE room_id = ?1 AND agent_id = ?2 AND user_scope = ?3",
                params![room_id, agent_id, user_scope],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn get_or_create(&self, room_id: &str, agent_id: &str, user_scope: &str) -> Result<String, BridgeError> {
        if let Some(existing) = self.get(room_id, agent_id, user_scope)? {
            return Ok(existing);
        }

        let candidate_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversation_bindings
                     (conversation_id, room_id, agent_id, user_scope, created_at, last_message_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(room_id, agent_id, user_scope) DO NOTHING",
                params![candidate_id, room_id, agent_id, user_scope, now],
            )?;
            Ok(())
        })?;

        self.get(room_id, agent_id, user_scope)?
            .ok_or_else(|| BridgeError::Fatal { detail: "conversation binding vanished after insert".into() })
    }

    pub fn touch(&self, conversation_id: &str) -> Result<(), BridgeError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE conversation_bindings SET last_message_at = ?1 WHERE conversation_id = ?2",
                params![now, conversation_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_stable_across_repeated_calls() {
        let db = Db::open_in_memory().expect("open");
        let store = ConversationStore::new(&db);
        let first = store.get_or_create("!room:x", "agent-1", "").expect("create");
        let second = store.get_or_create("!room:x", "agent-1", "").expect("reuse");
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_rooms_get_distinct_conversations() {
        let db = Db::open_in_memory().expect("open");
        let store = ConversationStore::new(&db);
        let a = store.get_or_create("!room-a:x", "agent-1", "").expect("a");
        let b = store.get_or_create("!room-b:x", "agent-1", "").expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn distinct_user_scopes_get_distinct_conversations() {
        let db = Db::open_in_memory().expect("open");
        let store = ConversationStore::new(&db);
        let a = store.get_or_create("!room:x", "agent-1", "alice").expect("a");
        let b = store.get_or_create("!room:x", "agent-1", "bob").expect("b");
        assert_ne!(a, b);
    }
}
