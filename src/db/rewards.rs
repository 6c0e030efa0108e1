//! Redeemable rewards

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_timestamp;
use super::rules::validate_points;
use crate::error::{sql_err, LedgerError};

/// Reward row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRow {
    pub id: String,
    pub family_id: String,
    pub name: String,
    pub description: Option<String>,
    pub points_required: i64,
    pub image_url: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating a reward
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRewardInput {
    #[serde(default)]
    pub id: Option<String>,
    pub family_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(alias = "points", alias = "cost")]
    pub points_required: i64,
    #[serde(default, alias = "url")]
    pub image_url: Option<String>,
}

/// Partial update of a reward
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRewardInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "points", alias = "cost")]
    pub points_required: Option<i64>,
    #[serde(default, alias = "url")]
    pub image_url: Option<String>,
    #[serde(default, alias = "is_active")]
    pub active: Option<bool>,
}

fn reward_from_row(row: &Row<'_>) -> rusqlite::Result<RewardRow> {
    Ok(RewardRow {
        id: row.get(0)?,
        family_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        points_required: row.get(4)?,
        image_url: row.get(5)?,
        active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const REWARD_COLUMNS: &str =
    "id, family_id, name, description, points_required, image_url, active, created_at, updated_at";

/// Get a reward by ID
pub fn get_reward(conn: &Connection, id: &str) -> Result<Option<RewardRow>, LedgerError> {
    let sql = format!("SELECT {} FROM rewards WHERE id = ?", REWARD_COLUMNS);
    conn.query_row(&sql, params![id], reward_from_row)
        .optional()
        .map_err(sql_err("Failed to get reward"))
}

/// List rewards of a family
pub fn list_rewards(
    conn: &Connection,
    family_id: &str,
    active_only: bool,
) -> Result<Vec<RewardRow>, LedgerError> {
    let mut sql = format!("SELECT {} FROM rewards WHERE family_id = ?", REWARD_COLUMNS);
    if active_only {
        sql.push_str(" AND active = 1");
    }
    sql.push_str(" ORDER BY points_required, name");

    let mut stmt = conn.prepare(&sql).map_err(sql_err("Failed to prepare statement"))?;
    let rows = stmt
        .query_map(params![family_id], reward_from_row)
        .map_err(sql_err("Failed to query rewards"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Failed to read row"))?);
    }
    Ok(results)
}

fn validate_points_required(points: i64) -> Result<(), LedgerError> {
    if points <= 0 {
        return Err(LedgerError::InvalidInput(
            "points_required must be greater than zero".into(),
        ));
    }
    validate_points(points, "points_required")
}

/// Create a reward
pub fn create_reward(conn: &Connection, input: CreateRewardInput) -> Result<RewardRow, LedgerError> {
    if input.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("reward name is required".into()));
    }
    validate_points_required(input.points_required)?;

    let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO rewards (id, family_id, name, description, points_required, image_url, active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![
            id,
            input.family_id,
            input.name.trim(),
            input.description,
            input.points_required,
            input.image_url,
            now,
            now,
        ],
    )
    .map_err(sql_err("Failed to create reward"))?;

    get_reward(conn, &id)?
        .ok_or_else(|| LedgerError::Internal("Failed to retrieve created reward".into()))
}

/// Update a reward; pending redemptions keep their point snapshot
pub fn update_reward(
    conn: &Connection,
    id: &str,
    input: UpdateRewardInput,
) -> Result<RewardRow, LedgerError> {
    let current = get_reward(conn, id)?
        .ok_or_else(|| LedgerError::NotFound(format!("reward {}", id)))?;

    if let Some(points) = input.points_required {
        validate_points_required(points)?;
    }

    conn.execute(
        "UPDATE rewards SET name = ?, description = ?, points_required = ?, image_url = ?,
         active = ?, updated_at = ? WHERE id = ?",
        params![
            input.name.unwrap_or(current.name),
            input.description.or(current.description),
            input.points_required.unwrap_or(current.points_required),
            input.image_url.or(current.image_url),
            input.active.unwrap_or(current.active),
            now_timestamp(),
            id,
        ],
    )
    .map_err(sql_err("Failed to update reward"))?;

    get_reward(conn, id)?
        .ok_or_else(|| LedgerError::Internal("Failed to retrieve updated reward".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::rules::MAX_POINTS;

    #[test]
    fn test_url_alias_normalized_to_image_url() {
        let input: CreateRewardInput = serde_json::from_value(serde_json::json!({
            "family_id": "fam",
            "name": "Ice cream",
            "points": 5,
            "url": "https://img.example/ice.png",
        }))
        .unwrap();

        assert_eq!(input.points_required, 5);
        assert_eq!(input.image_url.as_deref(), Some("https://img.example/ice.png"));
    }

    #[test]
    fn test_zero_cost_rejected() {
        assert!(validate_points_required(0).is_err());
        assert!(validate_points_required(1).is_ok());
    }

    #[test]
    fn test_cost_capped() {
        assert!(validate_points_required(MAX_POINTS).is_ok());
        assert!(matches!(
            validate_points_required(MAX_POINTS + 1),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(validate_points_required(i64::MAX).is_err());
        assert!(validate_points_required(i64::MIN).is_err());
    }
}
