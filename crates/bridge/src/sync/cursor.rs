// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::error::BridgeError;
use crate::storage::Db;

/// Durable, single-writer-per-identity `SyncCursor` storage. The cursor
/// write is a separate transaction from downstream event processing, so a
/// crash mid-processing re-processes at most one batch rather than losing
/// the cursor entirely.
pub struct CursorStore<'a> {
    db: &'a Db,
}

impl<'a> CursorStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn load(&self, agent_id: &str) -> Result<Option<String>, BridgeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT since_token FROM sync_cursors WHERE agent_id = ?1",
                params![agent_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
        })
    }

    /// Atomically persist the cursor after a batch has been fully processed.
    pub fn store(&self, agent_id: &str, since_token: &str) -> Result<(), BridgeError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_cursors (agent_id, since_token, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(agent_id) DO UPDATE SET since_token = excluded.since_token, updated_at = excluded.updated_at",
                params![agent_id, since_token, now],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_roundtrips() {
        let db = Db::open_in_memory().expect("open");
        let cursors = CursorStore::new(&db);
        assert_eq!(cursors.load("agent-1").expect("load"), None);
        cursors.store("agent-1", "s123").expect("store");
        assert_eq!(cursors.load("agent-1").expect("load"), Some("s123".to_owned()));
    }
}
