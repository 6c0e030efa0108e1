//! Reward redemption storage

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::now_timestamp;
use crate::error::{sql_err, LedgerError};

/// Redemption lifecycle
///
/// ```text
/// pending ──► approved ──► completed
///    │                        ▲
///    ├────────────────────────┘
///    └──► rejected (points credited back)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    Pending,
    Approved,
    Completed,
    Rejected,
}

impl RedemptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Approved => "approved",
            RedemptionStatus::Completed => "completed",
            RedemptionStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RedemptionStatus::Completed | RedemptionStatus::Rejected)
    }

    pub fn can_transition_to(&self, next: RedemptionStatus) -> bool {
        use RedemptionStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Completed) | (Approved, Completed)
        )
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedemptionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RedemptionStatus::Pending),
            "approved" => Ok(RedemptionStatus::Approved),
            "completed" => Ok(RedemptionStatus::Completed),
            "rejected" => Ok(RedemptionStatus::Rejected),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown redemption status '{}'",
                other
            ))),
        }
    }
}

impl FromSql for RedemptionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
    }
}

/// Redemption row from database
#[derive(Debug, Clone, Serialize)]
pub struct RedemptionRow {
    pub id: String,
    pub child_id: String,
    pub reward_id: String,
    pub points: i64,
    pub requested_by: String,
    pub status: RedemptionStatus,
    pub decided_by: Option<String>,
    pub created_at: String,
    pub decided_at: Option<String>,
}

/// Values for a new redemption
#[derive(Debug, Clone)]
pub struct NewRedemption<'a> {
    pub id: &'a str,
    pub child_id: &'a str,
    pub reward_id: &'a str,
    pub points: i64,
    pub requested_by: &'a str,
    pub status: RedemptionStatus,
}

const REDEMPTION_COLUMNS: &str = "id, child_id, reward_id, points, requested_by, status,
     decided_by, created_at, decided_at";

fn redemption_from_row(row: &Row<'_>) -> rusqlite::Result<RedemptionRow> {
    Ok(RedemptionRow {
        id: row.get(0)?,
        child_id: row.get(1)?,
        reward_id: row.get(2)?,
        points: row.get(3)?,
        requested_by: row.get(4)?,
        status: row.get(5)?,
        decided_by: row.get(6)?,
        created_at: row.get(7)?,
        decided_at: row.get(8)?,
    })
}

/// Get a redemption by ID
pub fn get_redemption(conn: &Connection, id: &str) -> Result<Option<RedemptionRow>, LedgerError> {
    let sql = format!("SELECT {} FROM redemptions WHERE id = ?", REDEMPTION_COLUMNS);
    conn.query_row(&sql, params![id], redemption_from_row)
        .optional()
        .map_err(sql_err("Failed to get redemption"))
}

/// List redemptions of a child, newest first
pub fn list_for_child(
    conn: &Connection,
    child_id: &str,
    limit: i64,
) -> Result<Vec<RedemptionRow>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM redemptions WHERE child_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        REDEMPTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(sql_err("Failed to prepare statement"))?;
    let rows = stmt
        .query_map(params![child_id, limit], redemption_from_row)
        .map_err(sql_err("Failed to query redemptions"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Failed to read row"))?);
    }
    Ok(results)
}

/// Insert a redemption row
pub fn insert_redemption(conn: &Connection, redemption: &NewRedemption<'_>) -> Result<(), LedgerError> {
    let now = now_timestamp();
    let decided_at = redemption.status.is_terminal().then_some(now.as_str());

    conn.execute(
        "INSERT INTO redemptions (id, child_id, reward_id, points, requested_by, status,
         decided_by, created_at, decided_at)
         VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)",
        params![
            redemption.id,
            redemption.child_id,
            redemption.reward_id,
            redemption.points,
            redemption.requested_by,
            redemption.status.as_str(),
            now,
            decided_at,
        ],
    )
    .map_err(sql_err("Failed to insert redemption"))?;

    Ok(())
}

/// Conditionally move a redemption from `from` to `to`.
///
/// Returns false when the stored status is no longer `from`.
pub fn transition(
    conn: &Connection,
    id: &str,
    from: RedemptionStatus,
    to: RedemptionStatus,
    decided_by: &str,
) -> Result<bool, LedgerError> {
    if !from.can_transition_to(to) {
        return Err(LedgerError::InvalidState(format!(
            "redemption cannot move from {} to {}",
            from, to
        )));
    }

    let rows = conn
        .execute(
            "UPDATE redemptions SET status = ?, decided_by = ?, decided_at = ?
             WHERE id = ? AND status = ?",
            params![to.as_str(), decided_by, now_timestamp(), id, from.as_str()],
        )
        .map_err(sql_err("Failed to update redemption"))?;

    Ok(rows == 1)
}
