// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sqlite-backed state persistence for identities, bindings, cursors, and
//! in-flight delivery records.

pub mod migrations;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::BridgeError;

/// Blocking sqlite handle guarded by a std mutex. Callers run operations
/// through `tokio::task::spawn_blocking` so the connection never stalls the
/// async runtime.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, BridgeError> {
        let conn = Connection::open(path)
            .map_err(|e| BridgeError::Fatal { detail: format!("failed to open database: {e}") })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| BridgeError::Fatal { detail: format!("failed to set pragmas: {e}") })?;
        migrations::run(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, BridgeError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BridgeError::Fatal { detail: format!("failed to open database: {e}") })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| BridgeError::Fatal { detail: format!("failed to set pragmas: {e}") })?;
        migrations::run(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run a closure with exclusive access to the underlying connection.
    ///
    /// The lock is a `std::sync::Mutex`, so callers must not hold it across
    /// an `.await` point; wrap calls in `spawn_blocking` from async contexts.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, BridgeError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| BridgeError::Fatal { detail: "database mutex poisoned".into() })?;
        f(&conn).map_err(|e| BridgeError::Fatal { detail: format!("sqlite error: {e}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let db = Db::open_in_memory().expect("open");
        db.with_conn(|conn| conn.execute("SELECT 1 FROM identities LIMIT 0", [])).expect("table exists");
    }
}
