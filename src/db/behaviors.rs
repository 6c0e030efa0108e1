//! Behavior event storage

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::now_timestamp;
use crate::error::{sql_err, LedgerError};

/// Verification state of a behavior event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Pending,
    Verified,
    Rejected,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Pending => "pending",
            VerificationState::Verified => "verified",
            VerificationState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, VerificationState::Pending)
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VerificationState::Pending),
            "verified" => Ok(VerificationState::Verified),
            "rejected" => Ok(VerificationState::Rejected),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown verification state '{}'",
                other
            ))),
        }
    }
}

impl FromSql for VerificationState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
    }
}

/// Behavior event row from database
#[derive(Debug, Clone, Serialize)]
pub struct BehaviorEventRow {
    pub id: String,
    pub child_id: String,
    pub rule_id: String,
    pub points: i64,
    pub note: Option<String>,
    pub created_by: String,
    pub verification_state: VerificationState,
    pub verified_by: Option<String>,
    pub created_at: String,
    pub decided_at: Option<String>,
}

/// Values for a new behavior event
#[derive(Debug, Clone)]
pub struct NewBehaviorEvent<'a> {
    pub id: &'a str,
    pub child_id: &'a str,
    pub rule_id: &'a str,
    pub points: i64,
    pub note: Option<&'a str>,
    pub created_by: &'a str,
    pub verification_state: VerificationState,
}

const BEHAVIOR_COLUMNS: &str = "id, child_id, rule_id, points, note, created_by,
     verification_state, verified_by, created_at, decided_at";

fn behavior_from_row(row: &Row<'_>) -> rusqlite::Result<BehaviorEventRow> {
    Ok(BehaviorEventRow {
        id: row.get(0)?,
        child_id: row.get(1)?,
        rule_id: row.get(2)?,
        points: row.get(3)?,
        note: row.get(4)?,
        created_by: row.get(5)?,
        verification_state: row.get(6)?,
        verified_by: row.get(7)?,
        created_at: row.get(8)?,
        decided_at: row.get(9)?,
    })
}

/// Get a behavior event by ID
pub fn get_behavior(conn: &Connection, id: &str) -> Result<Option<BehaviorEventRow>, LedgerError> {
    let sql = format!("SELECT {} FROM behavior_events WHERE id = ?", BEHAVIOR_COLUMNS);
    conn.query_row(&sql, params![id], behavior_from_row)
        .optional()
        .map_err(sql_err("Failed to get behavior event"))
}

/// List behavior events of a child, newest first
pub fn list_for_child(
    conn: &Connection,
    child_id: &str,
    state: Option<VerificationState>,
    limit: i64,
) -> Result<Vec<BehaviorEventRow>, LedgerError> {
    let mut sql = format!("SELECT {} FROM behavior_events WHERE child_id = ?", BEHAVIOR_COLUMNS);
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(child_id.to_string())];

    if let Some(state) = state {
        sql.push_str(" AND verification_state = ?");
        params_vec.push(Box::new(state.as_str()));
    }

    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
    params_vec.push(Box::new(limit));

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&sql).map_err(sql_err("Failed to prepare statement"))?;
    let rows = stmt
        .query_map(params_refs.as_slice(), behavior_from_row)
        .map_err(sql_err("Failed to query behavior events"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Failed to read row"))?);
    }
    Ok(results)
}

/// Insert a behavior event. A decided event records its creator as verifier.
pub fn insert_behavior(conn: &Connection, event: &NewBehaviorEvent<'_>) -> Result<(), LedgerError> {
    let now = now_timestamp();
    let (verified_by, decided_at) = if event.verification_state.is_terminal() {
        (Some(event.created_by), Some(now.as_str()))
    } else {
        (None, None)
    };

    conn.execute(
        "INSERT INTO behavior_events (id, child_id, rule_id, points, note, created_by,
         verification_state, verified_by, created_at, decided_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.id,
            event.child_id,
            event.rule_id,
            event.points,
            event.note,
            event.created_by,
            event.verification_state.as_str(),
            verified_by,
            now,
            decided_at,
        ],
    )
    .map_err(sql_err("Failed to insert behavior event"))?;

    Ok(())
}

/// Move a pending event into a terminal state.
///
/// Returns false if the event was no longer pending, which means another
/// decision won the race and nothing was changed.
pub fn mark_decided(
    conn: &Connection,
    id: &str,
    state: VerificationState,
    decided_by: &str,
) -> Result<bool, LedgerError> {
    if !state.is_terminal() {
        return Err(LedgerError::InvalidState("cannot move an event back to pending".into()));
    }

    let rows = conn
        .execute(
            "UPDATE behavior_events SET verification_state = ?, verified_by = ?, decided_at = ?
             WHERE id = ? AND verification_state = 'pending'",
            params![state.as_str(), decided_by, now_timestamp(), id],
        )
        .map_err(sql_err("Failed to decide behavior event"))?;

    Ok(rows == 1)
}
