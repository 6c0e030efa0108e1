//! Point rules
//!
//! A rule's `points` carries its sign: reward rules are positive, punishment
//! rules negative. Behavior events copy the value when recorded, so edits here
//! only affect behaviors recorded afterwards.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_timestamp;
use crate::error::{sql_err, LedgerError};

/// Largest magnitude a rule, reward or single ledger delta may carry
pub const MAX_POINTS: i64 = 1_000_000;

/// Check that a point value is non-zero and within [`MAX_POINTS`]
pub fn validate_points(points: i64, what: &str) -> Result<(), LedgerError> {
    match points.checked_abs() {
        Some(0) => Err(LedgerError::InvalidInput(format!("{} must be non-zero", what))),
        Some(magnitude) if magnitude <= MAX_POINTS => Ok(()),
        _ => Err(LedgerError::InvalidInput(format!(
            "{} must be at most {} in magnitude",
            what, MAX_POINTS
        ))),
    }
}

/// Rule classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Reward,
    Punishment,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Reward => "reward",
            RuleType::Punishment => "punishment",
        }
    }

    /// Give `points` the sign this classification requires
    pub fn signed_points(&self, points: i64) -> Result<i64, LedgerError> {
        validate_points(points, "rule points")?;
        let magnitude = points
            .checked_abs()
            .ok_or_else(|| LedgerError::InvalidInput("rule points out of range".into()))?;
        Ok(match self {
            RuleType::Reward => magnitude,
            RuleType::Punishment => -magnitude,
        })
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromSql for RuleType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "reward" => Ok(RuleType::Reward),
            "punishment" => Ok(RuleType::Punishment),
            other => Err(FromSqlError::Other(
                format!("unknown rule type '{}'", other).into(),
            )),
        }
    }
}

/// Rule row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRow {
    pub id: String,
    pub family_id: String,
    pub name: String,
    pub description: Option<String>,
    pub rule_type: RuleType,
    pub points: i64,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating a rule
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRuleInput {
    #[serde(default)]
    pub id: Option<String>,
    pub family_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(alias = "type")]
    pub rule_type: RuleType,
    #[serde(alias = "point_value")]
    pub points: i64,
}

/// Prospective edit of a rule
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRuleInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "point_value")]
    pub points: Option<i64>,
    #[serde(default, alias = "is_active")]
    pub active: Option<bool>,
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        id: row.get(0)?,
        family_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        rule_type: row.get(4)?,
        points: row.get(5)?,
        active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const RULE_COLUMNS: &str =
    "id, family_id, name, description, rule_type, points, active, created_at, updated_at";

/// Get a rule by ID
pub fn get_rule(conn: &Connection, id: &str) -> Result<Option<RuleRow>, LedgerError> {
    let sql = format!("SELECT {} FROM rules WHERE id = ?", RULE_COLUMNS);
    conn.query_row(&sql, params![id], rule_from_row)
        .optional()
        .map_err(sql_err("Failed to get rule"))
}

/// List rules of a family
pub fn list_rules(
    conn: &Connection,
    family_id: &str,
    active_only: bool,
) -> Result<Vec<RuleRow>, LedgerError> {
    let mut sql = format!("SELECT {} FROM rules WHERE family_id = ?", RULE_COLUMNS);
    if active_only {
        sql.push_str(" AND active = 1");
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = conn.prepare(&sql).map_err(sql_err("Failed to prepare statement"))?;
    let rows = stmt
        .query_map(params![family_id], rule_from_row)
        .map_err(sql_err("Failed to query rules"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Failed to read row"))?);
    }
    Ok(results)
}

/// Create a rule, normalizing the sign of its points
pub fn create_rule(conn: &Connection, input: CreateRuleInput) -> Result<RuleRow, LedgerError> {
    if input.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("rule name is required".into()));
    }
    let points = input.rule_type.signed_points(input.points)?;

    let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO rules (id, family_id, name, description, rule_type, points, active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![
            id,
            input.family_id,
            input.name.trim(),
            input.description,
            input.rule_type.as_str(),
            points,
            now,
            now,
        ],
    )
    .map_err(sql_err("Failed to create rule"))?;

    get_rule(conn, &id)?
        .ok_or_else(|| LedgerError::Internal("Failed to retrieve created rule".into()))
}

/// Apply a prospective edit; existing behavior events keep their snapshot
pub fn update_rule(
    conn: &Connection,
    id: &str,
    input: UpdateRuleInput,
) -> Result<RuleRow, LedgerError> {
    let current = get_rule(conn, id)?.ok_or_else(|| LedgerError::RuleNotFound(id.to_string()))?;

    let points = match input.points {
        Some(p) => current.rule_type.signed_points(p)?,
        None => current.points,
    };

    conn.execute(
        "UPDATE rules SET name = ?, description = ?, points = ?, active = ?, updated_at = ?
         WHERE id = ?",
        params![
            input.name.unwrap_or(current.name),
            input.description.or(current.description),
            points,
            input.active.unwrap_or(current.active),
            now_timestamp(),
            id,
        ],
    )
    .map_err(sql_err("Failed to update rule"))?;

    get_rule(conn, id)?
        .ok_or_else(|| LedgerError::Internal("Failed to retrieve updated rule".into()))
}
