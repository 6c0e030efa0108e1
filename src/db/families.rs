//! Families, membership roles and family policy

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_timestamp;
use crate::error::{sql_err, LedgerError};

// =============================================================================
// Types
// =============================================================================

/// Membership role inside a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Parent,
    Guardian,
    Member,
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Guardian => "guardian",
            Role::Member => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent" => Ok(Role::Parent),
            "guardian" => Ok(Role::Guardian),
            "member" => Ok(Role::Member),
            other => Err(LedgerError::InvalidInput(format!("unknown role '{}'", other))),
        }
    }
}

/// Per-family switches for the approval workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyPolicy {
    /// Reward-type behaviors need a second member's verification
    pub verify_rewards: bool,
    /// Punishment-type behaviors need a second member's verification
    pub verify_punishments: bool,
    /// The creator of an event may decide it themselves
    pub allow_self_approval: bool,
    /// Redemptions are created `completed` instead of `pending`
    pub auto_complete_redemptions: bool,
    /// Punishments may push a balance below zero (redemptions never may)
    pub allow_negative_balance: bool,
}

impl Default for FamilyPolicy {
    fn default() -> Self {
        Self {
            verify_rewards: false,
            verify_punishments: false,
            allow_self_approval: false,
            auto_complete_redemptions: false,
            allow_negative_balance: true,
        }
    }
}

/// Family row from database
#[derive(Debug, Clone, Serialize)]
pub struct FamilyRow {
    pub id: String,
    pub name: String,
    pub policy: FamilyPolicy,
    pub created_at: String,
}

/// Family member row from database
#[derive(Debug, Clone, Serialize)]
pub struct FamilyMemberRow {
    pub family_id: String,
    pub user_id: String,
    pub role: Role,
    pub display_name: Option<String>,
    pub joined_at: String,
}

/// Input for creating a family
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFamilyInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Input for adding a member
#[derive(Debug, Clone, Deserialize)]
pub struct AddMemberInput {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub display_name: Option<String>,
}

// =============================================================================
// Operations
// =============================================================================

const FAMILY_COLUMNS: &str = "id, name, verify_rewards, verify_punishments, allow_self_approval,
     auto_complete_redemptions, allow_negative_balance, created_at";

fn family_from_row(row: &Row<'_>) -> rusqlite::Result<FamilyRow> {
    Ok(FamilyRow {
        id: row.get(0)?,
        name: row.get(1)?,
        policy: FamilyPolicy {
            verify_rewards: row.get(2)?,
            verify_punishments: row.get(3)?,
            allow_self_approval: row.get(4)?,
            auto_complete_redemptions: row.get(5)?,
            allow_negative_balance: row.get(6)?,
        },
        created_at: row.get(7)?,
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<FamilyMemberRow> {
    Ok(FamilyMemberRow {
        family_id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        display_name: row.get(3)?,
        joined_at: row.get(4)?,
    })
}

/// Get a family by ID
pub fn get_family(conn: &Connection, id: &str) -> Result<Option<FamilyRow>, LedgerError> {
    let sql = format!("SELECT {} FROM families WHERE id = ?", FAMILY_COLUMNS);
    conn.query_row(&sql, params![id], family_from_row)
        .optional()
        .map_err(sql_err("Failed to get family"))
}

/// Get a family or fail with `NotFound`
pub fn require_family(conn: &Connection, id: &str) -> Result<FamilyRow, LedgerError> {
    get_family(conn, id)?.ok_or_else(|| LedgerError::NotFound(format!("family {}", id)))
}

/// Create a family; the creator joins it as a parent
pub fn create_family(
    conn: &Connection,
    input: CreateFamilyInput,
    creator_user_id: &str,
    policy: FamilyPolicy,
) -> Result<FamilyRow, LedgerError> {
    if input.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("family name is required".into()));
    }

    let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO families (id, name, verify_rewards, verify_punishments, allow_self_approval,
         auto_complete_redemptions, allow_negative_balance, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            input.name.trim(),
            policy.verify_rewards,
            policy.verify_punishments,
            policy.allow_self_approval,
            policy.auto_complete_redemptions,
            policy.allow_negative_balance,
            now,
        ],
    )
    .map_err(sql_err("Failed to create family"))?;

    add_member(
        conn,
        &id,
        AddMemberInput {
            user_id: creator_user_id.to_string(),
            role: Role::Parent,
            display_name: input.display_name,
        },
    )?;

    get_family(conn, &id)?
        .ok_or_else(|| LedgerError::Internal("Failed to retrieve created family".into()))
}

/// Replace a family's policy flags
pub fn update_policy(
    conn: &Connection,
    family_id: &str,
    policy: FamilyPolicy,
) -> Result<FamilyRow, LedgerError> {
    let rows = conn
        .execute(
            "UPDATE families SET verify_rewards = ?, verify_punishments = ?, allow_self_approval = ?,
             auto_complete_redemptions = ?, allow_negative_balance = ? WHERE id = ?",
            params![
                policy.verify_rewards,
                policy.verify_punishments,
                policy.allow_self_approval,
                policy.auto_complete_redemptions,
                policy.allow_negative_balance,
                family_id,
            ],
        )
        .map_err(sql_err("Failed to update policy"))?;

    if rows == 0 {
        return Err(LedgerError::NotFound(format!("family {}", family_id)));
    }

    get_family(conn, family_id)?
        .ok_or_else(|| LedgerError::Internal("Failed to retrieve updated family".into()))
}

/// Add or re-role a family member
pub fn add_member(
    conn: &Connection,
    family_id: &str,
    input: AddMemberInput,
) -> Result<FamilyMemberRow, LedgerError> {
    if input.user_id.trim().is_empty() {
        return Err(LedgerError::InvalidInput("user_id is required".into()));
    }

    conn.execute(
        "INSERT INTO family_members (family_id, user_id, role, display_name, joined_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(family_id, user_id) DO UPDATE SET
         role = excluded.role,
         display_name = COALESCE(excluded.display_name, family_members.display_name)",
        params![
            family_id,
            input.user_id,
            input.role.as_str(),
            input.display_name,
            now_timestamp(),
        ],
    )
    .map_err(sql_err("Failed to add member"))?;

    get_member(conn, family_id, &input.user_id)?
        .ok_or_else(|| LedgerError::Internal("Failed to retrieve added member".into()))
}

/// Look up a user's membership in a family
pub fn get_member(
    conn: &Connection,
    family_id: &str,
    user_id: &str,
) -> Result<Option<FamilyMemberRow>, LedgerError> {
    conn.query_row(
        "SELECT family_id, user_id, role, display_name, joined_at
         FROM family_members WHERE family_id = ? AND user_id = ?",
        params![family_id, user_id],
        member_from_row,
    )
    .optional()
    .map_err(sql_err("Failed to get member"))
}

/// List all members of a family
pub fn list_members(conn: &Connection, family_id: &str) -> Result<Vec<FamilyMemberRow>, LedgerError> {
    let mut stmt = conn
        .prepare(
            "SELECT family_id, user_id, role, display_name, joined_at
             FROM family_members WHERE family_id = ? ORDER BY joined_at",
        )
        .map_err(sql_err("Failed to prepare statement"))?;

    let rows = stmt
        .query_map(params![family_id], member_from_row)
        .map_err(sql_err("Failed to query members"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Failed to read row"))?);
    }
    Ok(results)
}
