// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::BridgeError;
use crate::identity::{derive_localpart, AgentIdentity, RoomBinding};
use crate::storage::Db;

/// Durable store for [`AgentIdentity`] and [`RoomBinding`] records.
///
/// All reads and writes go through the shared `Db`; callers on the async side
/// dispatch through `tokio::task::spawn_blocking`, matching the rest of the
/// persistence layer.
pub struct IdentityStore<'a> {
    db: &'a Db,
}

impl<'a> IdentityStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn get_by_agent_id(&self, agent_id: &str) -> Result<Option<AgentIdentity>, BridgeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("{SELECT_IDENTITY} WHERE agent_id = ?1"),
                params![agent_id],
                row_to_identity,
            )
            .optional()
        })
    }

    pub fn get_by_mxid(&self, mxid: &str) -> Result<Option<AgentIdentity>, BridgeError> {
        self.db.with_conn(|conn| {
            conn.query_row(&format!("{SELECT_IDENTITY} WHERE mxid = ?1"), params![mxid], row_to_identity)
                .optional()
        })
    }

    pub fn get_by_room_id(&self, room_id: &str) -> Result<Option<AgentIdentity>, BridgeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("{SELECT_IDENTITY} WHERE room_id = ?1"),
                params![room_id],
                row_to_identity,
            )
            .optional()
        })
    }

    pub fn get_by_localpart(&self, localpart: &str) -> Result<Option<AgentIdentity>, BridgeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("{SELECT_IDENTITY} WHERE localpart = ?1"),
                params![localpart],
                row_to_identity,
            )
            .optional()
        })
    }

    pub fn list_active(&self) -> Result<Vec<AgentIdentity>, BridgeError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_IDENTITY} WHERE removed_at IS NULL ORDER BY created_at ASC"))?;
            let rows = stmt.query_map([], row_to_identity)?;
            rows.collect()
        })
    }

    /// Create-or-update keyed on `agent_id`. `localpart`, `mxid`, and
    /// `password_seed` are preserved across renames once set.
    pub fn upsert(
        &self,
        agent_id: &str,
        agent_name: &str,
        mxid: Option<&str>,
        room_id: Option<&str>,
    ) -> Result<AgentIdentity, BridgeError> {
        self.upsert_with_localpart(agent_id, agent_name, mxid, room_id, None)
    }

    /// Like [`Self::upsert`], but lets the caller supply the localpart to use
    /// when *creating* a new identity (ignored on update). The Reconciler
    /// uses this to apply the numeric-suffix tie-break when two agents
    /// collide on their derived localpart.
    pub fn upsert_with_localpart(
        &self,
        agent_id: &str,
        agent_name: &str,
        mxid: Option<&str>,
        room_id: Option<&str>,
        localpart_override: Option<&str>,
    ) -> Result<AgentIdentity, BridgeError> {
        let now = Utc::now();
        let existing = self.get_by_agent_id(agent_id)?;

        let (localpart, mxid, password_seed, created_at) = match &existing {
            Some(identity) => (
                identity.localpart.clone(),
                mxid.map(str::to_owned).unwrap_or_else(|| identity.mxid.clone()),
                identity.password_seed.clone(),
                identity.created_at,
            ),
            None => {
                let localpart =
                    localpart_override.map(str::to_owned).unwrap_or_else(|| derive_localpart(agent_id));
                let mxid = mxid
                    .map(str::to_owned)
                    .ok_or_else(|| BridgeError::MalformedInput {
                        detail: "mxid required when creating a new identity".into(),
                    })?;
                (localpart, mxid, uuid::Uuid::new_v4().to_string(), now)
            }
        };

        let room_id = room_id.map(str::to_owned).or_else(|| existing.as_ref().and_then(|i| i.room_id.clone()));

        self.db.with_conn(|conn| {
            let conflict = conn
                .query_row(
                    "SELECT agent_id FROM identities WHERE mxid = ?1 AND agent_id != ?2",
                    params![mxid, agent_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if conflict.is_some() {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                    Some(format!("mxid {mxid} already bound to a different agent_id")),
                ));
            }

            conn.execute(
                "INSERT INTO identities (agent_id, agent_name, mxid, localpart, password_seed, room_id, status, created_at, updated_at, removed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8, NULL)
                 ON CONFLICT(agent_id) DO UPDATE SET
                    agent_name = excluded.agent_name,
                    mxid = excluded.mxid,
                    room_id = excluded.room_id,
                    updated_at = excluded.updated_at,
                    removed_at = NULL",
                params![
                    agent_id,
                    agent_name,
                    mxid,
                    localpart,
                    password_seed,
                    room_id,
                    created_at.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )?;
            Ok(())
        }).map_err(|e| match e {
            BridgeError::Fatal { detail } if detail.contains("already bound") => {
                BridgeError::IdentityConflict { detail }
            }
            other => other,
        })?;

        Ok(AgentIdentity {
            agent_id: agent_id.to_owned(),
            agent_name: agent_name.to_owned(),
            mxid,
            localpart,
            access_credential: existing.as_ref().and_then(|i| i.access_credential.clone()),
            password_seed,
            room_id,
            removed_at: None,
            created_at,
            updated_at: now,
        })
    }

    pub fn mark_removed(&self, agent_id: &str) -> Result<(), BridgeError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE identities SET removed_at = ?1, updated_at = ?1 WHERE agent_id = ?2",
                params![now, agent_id],
            )?;
            Ok(())
        })
    }

    pub fn bind_room(&self, agent_id: &str, room_id: &str) -> Result<(), BridgeError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .with_conn(|conn| {
                let conflict = conn
                    .query_row(
                        "SELECT agent_id FROM identities WHERE room_id = ?1 AND agent_id != ?2",
                        params![room_id, agent_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                if conflict.is_some() {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                        Some(format!("room_id {room_id} already bound to a different agent_id")),
                    ));
                }
                conn.execute(
                    "UPDATE identities SET room_id = ?1, updated_at = ?2 WHERE agent_id = ?3",
                    params![room_id, now, agent_id],
                )?;
                conn.execute(
                    "INSERT INTO room_bindings (room_id, agent_id, created_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(room_id) DO UPDATE SET agent_id = excluded.agent_id",
                    params![room_id, agent_id, now],
                )?;
                Ok(())
            })
            .map_err(|e| match e {
                BridgeError::Fatal { detail } if detail.contains("already bound") => {
                    BridgeError::IdentityConflict { detail }
                }
                other => other,
            })
    }

    pub fn update_credential(&self, agent_id: &str, token: &str) -> Result<(), BridgeError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE identities SET access_credential = ?1, updated_at = ?2 WHERE agent_id = ?3",
                params![token, now, agent_id],
            )?;
            Ok(())
        })
    }

    pub fn get_room_binding(&self, room_id: &str) -> Result<Option<RoomBinding>, BridgeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT room_id, agent_id, created_at FROM room_bindings WHERE room_id = ?1",
                params![room_id],
                |row| {
                    Ok(RoomBinding {
                        room_id: row.get(0)?,
                        agent_id: row.get(1)?,
                        canonical_name: String::new(),
                        space_parent_id: None,
                        created_at: row
                            .get::<_, String>(2)?
                            .parse()
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()
        })
    }

    /// Bulk export of active identity mappings, backing `GET /agents/mappings`
    /// and the `identity_list` tool operation.
    pub fn export_snapshot(&self) -> Result<Vec<AgentIdentity>, BridgeError> {
        self.list_active()
    }
}

const SELECT_IDENTITY: &str = "SELECT agent_id, agent_name, mxid, localpart, password_seed, \
     access_credential, room_id, created_at, updated_at, removed_at FROM identities";

fn row_to_identity(row: &Row) -> rusqlite::Result<AgentIdentity> {
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let removed_at: Option<String> = row.get(9)?;
    Ok(AgentIdentity {
        agent_id: row.get(0)?,
        agent_name: row.get(1)?,
        mxid: row.get(2)?,
        localpart: row.get(3)?,
        password_seed: row.get(4)?,
        access_credential: row.get(5)?,
        room_id: row.get(6)?,
        removed_at: removed_at.and_then(|s| s.parse().ok()),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}
