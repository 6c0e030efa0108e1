//! SQLite database module for the family points ledger
//!
//! ## Tables
//!
//! - `families` / `family_members` - Families, their policy flags and roles
//! - `children` - Children and their `total_points` balance
//! - `rules` / `rewards` - Point rules and redeemable rewards
//! - `behavior_events` - Recorded behaviors and their verification state
//! - `redemptions` - Reward redemptions and their approval status
//! - `ledger_entries` - Append-only log of applied point deltas, keyed by event id
//!
//! `children.total_points` is only written by [`ledger::apply_delta_tx`], in the
//! same transaction that inserts the matching `ledger_entries` row.

pub mod schema;
pub mod families;
pub mod children;
pub mod rules;
pub mod rewards;
pub mod behaviors;
pub mod redemptions;
pub mod ledger;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{sql_err, LedgerError};

/// Busy timeout used when none is configured
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database for the ledger
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the ledger database file
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, LedgerError> {
        info!("Opening SQLite ledger at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| LedgerError::Storage(format!("Failed to open SQLite: {}", e)))?;

        // WAL lets readers proceed while one writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(sql_err("Failed to set PRAGMA"))?;

        Self::from_connection(conn, busy_timeout)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Storage(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn, DEFAULT_BUSY_TIMEOUT)
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self, LedgerError> {
        conn.busy_timeout(busy_timeout)
            .map_err(sql_err("Failed to set busy timeout"))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(sql_err("Failed to enable foreign keys"))?;

        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run a write inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so concurrent writers (other handles or
    /// other processes on the same file) queue on SQLite's busy handler instead of
    /// failing mid-transaction on lock upgrade. The transaction commits only when
    /// `f` returns `Ok`; any error rolls back every statement `f` ran.
    pub fn write<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, LedgerError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err("Failed to begin transaction"))?;

        let value = f(&tx)?;

        tx.commit().map_err(sql_err("Failed to commit transaction"))?;
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, LedgerError> {
                let sql = format!("SELECT COUNT(*) FROM {}", table);
                conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(sql_err("Query failed"))
            };

            Ok(DbStats {
                family_count: count("families")?,
                child_count: count("children")?,
                behavior_count: count("behavior_events")?,
                redemption_count: count("redemptions")?,
                ledger_entry_count: count("ledger_entries")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub family_count: u64,
    pub child_count: u64,
    pub behavior_count: u64,
    pub redemption_count: u64,
    pub ledger_entry_count: u64,
}

/// Current UTC time in the format stored in every timestamp column
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// Re-exports
pub use behaviors::{BehaviorEventRow, VerificationState};
pub use children::ChildRow;
pub use families::{FamilyMemberRow, FamilyPolicy, FamilyRow, Role};
pub use ledger::{EntryKind, LedgerEntryRow, Reconciliation};
pub use redemptions::{RedemptionRow, RedemptionStatus};
pub use rewards::RewardRow;
pub use rules::{RuleRow, RuleType};
