// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identity Store: the durable mapping from external agent identifiers to
//! Matrix accounts and their canonical rooms.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The prefix stripped from `agent_id` before localpart derivation.
const KNOWN_AGENT_ID_PREFIX: &str = "agent-";

/// Derive a Matrix localpart from an opaque `agent_id`.
///
/// Pure and stable across renames: strips [`KNOWN_AGENT_ID_PREFIX`] if
/// present, replaces hyphens with underscores, then prefixes `agent_`.
///
/// `agent-597b5756-2915-4560-ba6b-91005f085166` becomes
/// `agent_597b5756_2915_4560_ba6b_91005f085166`.
pub fn derive_localpart(agent_id: &str) -> String {
    let stripped = agent_id.strip_prefix(KNOWN_AGENT_ID_PREFIX).unwrap_or(agent_id);
    let underscored = stripped.replace('-', "_");
    format!("agent_{underscored}")
}

/// A single bridged agent: its external identity, Matrix account, and the
/// canonical room bound to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_name: String,
    pub mxid: String,
    pub localpart: String,
    pub access_credential: Option<String>,
    pub password_seed: String,
    pub room_id: Option<String>,
    pub removed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentIdentity {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }

    pub fn canonical_room_name(&self) -> String {
        format!("{} - Agent Chat", self.agent_name)
    }
}

/// A room bound to exactly one primary agent, itself a child of the single
/// Agents Space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomBinding {
    pub room_id: String,
    pub agent_id: String,
    pub canonical_name: String,
    pub space_parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_prefix_and_underscores_hyphens() {
        let localpart = derive_localpart("agent-597b5756-2915-4560-ba6b-91005f085166");
        assert_eq!(localpart, "agent_597b5756_2915_4560_ba6b_91005f085166");
    }

    #[test]
    fn is_pure_and_stable_without_prefix() {
        assert_eq!(derive_localpart("abc-123"), "agent_abc_123");
        // Calling twice with the same input is stable.
        assert_eq!(derive_localpart("abc-123"), derive_localpart("abc-123"));
    }

    #[test]
    fn rename_does_not_change_localpart_derivation() {
        let before = derive_localpart("agent-fixed-id");
        let after = derive_localpart("agent-fixed-id");
        assert_eq!(before, after);
    }
}
