// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use rusqlite::Connection;

use crate::error::BridgeError;

/// Forward-only, idempotent schema migrations.
///
/// Each step is safe to re-run: tables use `CREATE TABLE IF NOT EXISTS`, and
/// columns added after the initial release use `ALTER TABLE ... ADD COLUMN`
/// wrapped so a pre-existing column doesn't fail the whole batch. A failure
/// inside one step rolls back only that step's own changes via an explicit
/// sqlite transaction, so a bad migration can't leave the schema half-applied.
pub fn run(conn: &Connection) -> Result<(), BridgeError> {
    for (name, sql) in MIGRATIONS {
        apply(conn, name, sql)?;
    }
    Ok(())
}

fn apply(conn: &Connection, name: &str, sql: &str) -> Result<(), BridgeError> {
    conn.execute_batch(&format!("BEGIN; {sql} COMMIT;")).map_err(|e| {
        let _ = conn.execute_batch("ROLLBACK;");
        BridgeError::Fatal { detail: format!("migration '{name}' failed: {e}") }
    })
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_identities",
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            agent_id          TEXT PRIMARY KEY,
            agent_name        TEXT NOT NULL,
            mxid              TEXT NOT NULL UNIQUE,
            localpart         TEXT NOT NULL UNIQUE,
            password_seed     TEXT NOT NULL,
            access_credential TEXT,
            room_id           TEXT UNIQUE,
            status            TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            removed_at        TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_identities_room_id ON identities(room_id);
        CREATE INDEX IF NOT EXISTS idx_identities_status ON identities(status);
        "#,
    ),
    (
        "0002_room_bindings",
        r#"
        CREATE TABLE IF NOT EXISTS room_bindings (
            room_id       TEXT PRIMARY KEY,
            agent_id      TEXT NOT NULL REFERENCES identities(agent_id),
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_room_bindings_agent_id ON room_bindings(agent_id);
        "#,
    ),
    (
        "0003_sync_cursors",
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            agent_id      TEXT PRIMARY KEY REFERENCES identities(agent_id),
            since_token   TEXT,
            updated_at    TEXT NOT NULL
        );
        "#,
    ),
    (
        "0004_conversation_bindings",
        r#"
        CREATE TABLE IF NOT EXISTS conversation_bindings (
            conversation_id TEXT PRIMARY KEY,
            room_id         TEXT NOT NULL,
            agent_id        TEXT NOT NULL REFERENCES identities(agent_id),
            user_scope      TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL,
            last_message_at TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversation_bindings_tuple
            ON conversation_bindings(room_id, agent_id, user_scope);
        CREATE INDEX IF NOT EXISTS idx_conversation_bindings_last_message_at ON conversation_bindings(last_message_at);
        "#,
    ),
    (
        "0005_inflight_records",
        r#"
        CREATE TABLE IF NOT EXISTS inflight_records (
            dedup_key     TEXT PRIMARY KEY,
            agent_id      TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            expires_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_inflight_records_expires_at ON inflight_records(expires_at);
        "#,
    ),
    (
        "0006_peer_registrations",
        r#"
        CREATE TABLE IF NOT EXISTS peer_registrations (
            session_id    TEXT PRIMARY KEY,
            directory     TEXT NOT NULL,
            listen_port   INTEGER NOT NULL,
            rooms         TEXT NOT NULL,
            last_seen_at  TEXT NOT NULL
        );
        "#,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        run(&conn).expect("first run");
        run(&conn).expect("second run should be a no-op");
    }
}
