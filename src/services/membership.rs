//! Family membership guard
//!
//! Decides which family members may record, approve, redeem or manage. The
//! decision itself is a pure function of role and action; [`authorize`] adds the
//! membership lookup. Every mutating service calls [`authorize`] inside its
//! write transaction before touching any row.

use std::fmt;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::families::{self, FamilyMemberRow, Role};
use crate::error::LedgerError;

/// Operations gated by membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Record a behavior against a rule
    Record,
    /// Verify/reject behaviors, approve/reject redemptions
    Approve,
    /// Redeem a reward for a child
    Redeem,
    /// Manage family setup: members, children, rules, rewards, policy
    Manage,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Record => write!(f, "record"),
            Action::Approve => write!(f, "approve"),
            Action::Redeem => write!(f, "redeem"),
            Action::Manage => write!(f, "manage"),
        }
    }
}

/// Whether a role may perform an action
pub fn role_permits(role: Role, action: Action) -> bool {
    match role {
        Role::Parent => true,
        Role::Guardian => !matches!(action, Action::Manage),
        Role::Member => matches!(action, Action::Redeem),
    }
}

/// Check that `user_id` belongs to `family_id` in any role (read access)
pub fn require_member(
    conn: &Connection,
    user_id: &str,
    family_id: &str,
) -> Result<FamilyMemberRow, LedgerError> {
    families::get_member(conn, family_id, user_id)?.ok_or_else(|| {
        warn!(user_id = %user_id, family_id = %family_id, "Not a family member");
        LedgerError::Unauthorized(format!(
            "user {} is not a member of family {}",
            user_id, family_id
        ))
    })
}

/// Check that `user_id` belongs to `family_id` with a role allowing `action`
pub fn authorize(
    conn: &Connection,
    user_id: &str,
    family_id: &str,
    action: Action,
) -> Result<FamilyMemberRow, LedgerError> {
    let member = require_member(conn, user_id, family_id)?;

    if !role_permits(member.role, action) {
        warn!(user_id = %user_id, role = %member.role, action = %action, "Role lacks permission");
        return Err(LedgerError::Unauthorized(format!(
            "role {} may not {}",
            member.role, action
        )));
    }

    Ok(member)
}
