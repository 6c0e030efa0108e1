//! Children and their point balance
//!
//! Nothing in this module writes `total_points`; see [`super::ledger`].

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_timestamp;
use crate::error::{sql_err, LedgerError};

/// Child row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRow {
    pub id: String,
    pub family_id: String,
    pub name: String,
    pub birth_date: Option<String>,
    pub total_points: i64,
    pub created_at: String,
}

/// Input for adding a child to a family
#[derive(Debug, Clone, Deserialize)]
pub struct CreateChildInput {
    #[serde(default)]
    pub id: Option<String>,
    pub family_id: String,
    pub name: String,
    #[serde(default)]
    pub birth_date: Option<String>,
}

fn child_from_row(row: &Row<'_>) -> rusqlite::Result<ChildRow> {
    Ok(ChildRow {
        id: row.get(0)?,
        family_id: row.get(1)?,
        name: row.get(2)?,
        birth_date: row.get(3)?,
        total_points: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Get a child by ID
pub fn get_child(conn: &Connection, id: &str) -> Result<Option<ChildRow>, LedgerError> {
    conn.query_row(
        "SELECT id, family_id, name, birth_date, total_points, created_at
         FROM children WHERE id = ?",
        params![id],
        child_from_row,
    )
    .optional()
    .map_err(sql_err("Failed to get child"))
}

/// Get a child or fail with `NotFound`
pub fn require_child(conn: &Connection, id: &str) -> Result<ChildRow, LedgerError> {
    get_child(conn, id)?.ok_or_else(|| LedgerError::NotFound(format!("child {}", id)))
}

/// List children of a family
pub fn list_children(conn: &Connection, family_id: &str) -> Result<Vec<ChildRow>, LedgerError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, family_id, name, birth_date, total_points, created_at
             FROM children WHERE family_id = ? ORDER BY created_at",
        )
        .map_err(sql_err("Failed to prepare statement"))?;

    let rows = stmt
        .query_map(params![family_id], child_from_row)
        .map_err(sql_err("Failed to query children"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Failed to read row"))?);
    }
    Ok(results)
}

/// Add a child with a zero balance
pub fn create_child(conn: &Connection, input: CreateChildInput) -> Result<ChildRow, LedgerError> {
    if input.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("child name is required".into()));
    }
    if let Some(ref birth_date) = input.birth_date {
        chrono::NaiveDate::parse_from_str(birth_date, "%Y-%m-%d").map_err(|_| {
            LedgerError::InvalidInput(format!("birth_date '{}' is not YYYY-MM-DD", birth_date))
        })?;
    }

    let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());

    conn.execute(
        "INSERT INTO children (id, family_id, name, birth_date, total_points, created_at)
         VALUES (?, ?, ?, ?, 0, ?)",
        params![id, input.family_id, input.name.trim(), input.birth_date, now_timestamp()],
    )
    .map_err(sql_err("Failed to create child"))?;

    require_child(conn, &id)
}

/// Remove a child; behavior events, redemptions and ledger entries cascade
pub fn delete_child(conn: &Connection, id: &str) -> Result<bool, LedgerError> {
    let rows = conn
        .execute("DELETE FROM children WHERE id = ?", params![id])
        .map_err(sql_err("Failed to delete child"))?;

    Ok(rows > 0)
}
