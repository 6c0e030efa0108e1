//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::{sql_err, LedgerError};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(sql_err("Failed to create schema_version table"))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(sql_err("Failed to clear schema_version"))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(sql_err("Failed to set schema_version"))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(FAMILY_SCHEMA)
        .map_err(sql_err("Failed to create family tables"))?;

    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(sql_err("Failed to create ledger tables"))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(sql_err("Failed to create indexes"))?;

    Ok(())
}

/// Families, members, children, rules and rewards
const FAMILY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS families (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,

    -- Policy flags
    verify_rewards INTEGER NOT NULL DEFAULT 0,
    verify_punishments INTEGER NOT NULL DEFAULT 0,
    allow_self_approval INTEGER NOT NULL DEFAULT 0,
    auto_complete_redemptions INTEGER NOT NULL DEFAULT 0,
    allow_negative_balance INTEGER NOT NULL DEFAULT 1,

    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS family_members (
    family_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('parent', 'guardian', 'member')),
    display_name TEXT,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (family_id, user_id),
    FOREIGN KEY (family_id) REFERENCES families(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS children (
    id TEXT PRIMARY KEY NOT NULL,
    family_id TEXT NOT NULL,
    name TEXT NOT NULL,
    birth_date TEXT,
    total_points INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (family_id) REFERENCES families(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY NOT NULL,
    family_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    rule_type TEXT NOT NULL CHECK (rule_type IN ('reward', 'punishment')),
    points INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (family_id) REFERENCES families(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS rewards (
    id TEXT PRIMARY KEY NOT NULL,
    family_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    points_required INTEGER NOT NULL CHECK (points_required > 0),
    image_url TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (family_id) REFERENCES families(id) ON DELETE CASCADE
);
"#;

/// Point-changing events and the applied-delta log
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS behavior_events (
    id TEXT PRIMARY KEY NOT NULL,
    child_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    -- Snapshot of rules.points at creation
    points INTEGER NOT NULL,
    note TEXT,
    created_by TEXT NOT NULL,
    verification_state TEXT NOT NULL
        CHECK (verification_state IN ('pending', 'verified', 'rejected')),
    verified_by TEXT,
    created_at TEXT NOT NULL,
    decided_at TEXT,
    FOREIGN KEY (child_id) REFERENCES children(id) ON DELETE CASCADE,
    FOREIGN KEY (rule_id) REFERENCES rules(id)
);

CREATE TABLE IF NOT EXISTS redemptions (
    id TEXT PRIMARY KEY NOT NULL,
    child_id TEXT NOT NULL,
    reward_id TEXT NOT NULL,
    -- Snapshot of rewards.points_required at redemption
    points INTEGER NOT NULL,
    requested_by TEXT NOT NULL,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'approved', 'completed', 'rejected')),
    decided_by TEXT,
    created_at TEXT NOT NULL,
    decided_at TEXT,
    FOREIGN KEY (child_id) REFERENCES children(id) ON DELETE CASCADE,
    FOREIGN KEY (reward_id) REFERENCES rewards(id)
);

-- One row per applied delta; the primary key is the idempotency key
CREATE TABLE IF NOT EXISTS ledger_entries (
    event_id TEXT PRIMARY KEY NOT NULL,
    child_id TEXT NOT NULL,
    delta INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('behavior', 'redemption', 'refund')),
    applied_at TEXT NOT NULL,
    FOREIGN KEY (child_id) REFERENCES children(id) ON DELETE CASCADE
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_members_user ON family_members(user_id);
CREATE INDEX IF NOT EXISTS idx_children_family ON children(family_id);
CREATE INDEX IF NOT EXISTS idx_rules_family ON rules(family_id);
CREATE INDEX IF NOT EXISTS idx_rewards_family ON rewards(family_id);

CREATE INDEX IF NOT EXISTS idx_behaviors_child ON behavior_events(child_id, created_at);
CREATE INDEX IF NOT EXISTS idx_behaviors_state ON behavior_events(verification_state);
CREATE INDEX IF NOT EXISTS idx_redemptions_child ON redemptions(child_id, created_at);
CREATE INDEX IF NOT EXISTS idx_redemptions_status ON redemptions(status);
CREATE INDEX IF NOT EXISTS idx_ledger_child ON ledger_entries(child_id, applied_at);
"#;
