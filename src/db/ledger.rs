//! Ledger store: the only writer of `children.total_points`
//!
//! Every point change is a row in `ledger_entries` keyed by the id of the event
//! that caused it. The balance update and the entry insert happen in one
//! transaction, so the pair is either fully applied or not at all, and a
//! second application of the same event id is refused.
//!
//! Balance updates are relative (`total_points = total_points + delta`) and
//! guarded in the `WHERE` clause, never computed in application code, so
//! concurrent writers for the same child cannot lose each other's deltas.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::debug;

use super::rules::validate_points;
use super::{now_timestamp, LedgerDb};
use crate::error::{sql_err, LedgerError};

/// What produced a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Behavior,
    Redemption,
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Behavior => "behavior",
            EntryKind::Redemption => "redemption",
            EntryKind::Refund => "refund",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromSql for EntryKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "behavior" => Ok(EntryKind::Behavior),
            "redemption" => Ok(EntryKind::Redemption),
            "refund" => Ok(EntryKind::Refund),
            other => Err(FromSqlError::Other(
                format!("unknown ledger entry kind '{}'", other).into(),
            )),
        }
    }
}

/// Ledger entry row from database
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntryRow {
    pub event_id: String,
    pub child_id: String,
    pub delta: i64,
    pub kind: EntryKind,
    pub applied_at: String,
}

/// Comparison of the stored balance against the entry log
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub child_id: String,
    pub recorded_balance: i64,
    pub ledger_sum: i64,
    pub entry_count: u64,
    pub consistent: bool,
}

/// Idempotency key of the compensating credit for a rejected redemption
pub fn refund_event_id(redemption_id: &str) -> String {
    format!("{}:refund", redemption_id)
}

/// A single point change to apply
#[derive(Debug, Clone, Copy)]
pub struct Delta<'a> {
    pub child_id: &'a str,
    pub event_id: &'a str,
    pub delta: i64,
    pub kind: EntryKind,
    /// Whether the balance may end below zero
    pub allow_negative: bool,
}

/// Apply a delta inside an open write transaction and return the new balance.
///
/// Fails with `DuplicateApplication` if the event id was already applied,
/// `NotFound` if the child does not exist and `InsufficientBalance` if the
/// delta would take the balance below zero without `allow_negative`. On any
/// error the caller's transaction must be dropped, which rolls back every
/// statement run so far.
pub fn apply_delta_tx(tx: &Transaction<'_>, change: Delta<'_>) -> Result<i64, LedgerError> {
    validate_points(change.delta, "ledger delta")?;

    if is_applied(tx, change.event_id)? {
        return Err(LedgerError::DuplicateApplication(change.event_id.to_string()));
    }

    let updated = tx
        .execute(
            "UPDATE children SET total_points = total_points + ?1
             WHERE id = ?2 AND (?3 OR total_points + ?1 >= 0)",
            params![change.delta, change.child_id, change.allow_negative],
        )
        .map_err(sql_err("Failed to update balance"))?;

    if updated == 0 {
        return match balance(tx, change.child_id)? {
            None => Err(LedgerError::NotFound(format!("child {}", change.child_id))),
            Some(current) => Err(LedgerError::InsufficientBalance {
                child_id: change.child_id.to_string(),
                balance: current,
                delta: change.delta,
            }),
        };
    }

    tx.execute(
        "INSERT INTO ledger_entries (event_id, child_id, delta, kind, applied_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            change.event_id,
            change.child_id,
            change.delta,
            change.kind.as_str(),
            now_timestamp(),
        ],
    )
    .map_err(sql_err("Failed to record ledger entry"))?;

    let new_balance = balance(tx, change.child_id)?
        .ok_or_else(|| LedgerError::Internal("Child vanished during update".into()))?;

    debug!(
        child_id = %change.child_id,
        event_id = %change.event_id,
        delta = change.delta,
        kind = %change.kind,
        new_balance,
        "Applied ledger delta"
    );

    Ok(new_balance)
}

impl LedgerDb {
    /// Apply a delta in its own transaction
    pub fn apply_delta(&self, change: Delta<'_>) -> Result<i64, LedgerError> {
        self.write(|tx| apply_delta_tx(tx, change))
    }
}

/// Whether an event id already has a ledger entry
pub fn is_applied(conn: &Connection, event_id: &str) -> Result<bool, LedgerError> {
    conn.query_row(
        "SELECT 1 FROM ledger_entries WHERE event_id = ?",
        params![event_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(sql_err("Failed to check ledger entry"))
}

/// Current balance of a child (None if the child does not exist)
pub fn balance(conn: &Connection, child_id: &str) -> Result<Option<i64>, LedgerError> {
    conn.query_row(
        "SELECT total_points FROM children WHERE id = ?",
        params![child_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(sql_err("Failed to read balance"))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntryRow> {
    Ok(LedgerEntryRow {
        event_id: row.get(0)?,
        child_id: row.get(1)?,
        delta: row.get(2)?,
        kind: row.get(3)?,
        applied_at: row.get(4)?,
    })
}

/// Ledger entries of a child, newest first
pub fn entries_for_child(
    conn: &Connection,
    child_id: &str,
    limit: i64,
) -> Result<Vec<LedgerEntryRow>, LedgerError> {
    let mut stmt = conn
        .prepare(
            "SELECT event_id, child_id, delta, kind, applied_at FROM ledger_entries
             WHERE child_id = ? ORDER BY applied_at DESC, rowid DESC LIMIT ?",
        )
        .map_err(sql_err("Failed to prepare statement"))?;

    let rows = stmt
        .query_map(params![child_id, limit], entry_from_row)
        .map_err(sql_err("Failed to query ledger entries"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Failed to read row"))?);
    }
    Ok(results)
}

/// Compare a child's stored balance with the sum of its ledger entries
pub fn reconcile(conn: &Connection, child_id: &str) -> Result<Reconciliation, LedgerError> {
    let recorded_balance = balance(conn, child_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("child {}", child_id)))?;

    let (ledger_sum, entry_count): (i64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(delta), 0), COUNT(*) FROM ledger_entries WHERE child_id = ?",
            params![child_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(sql_err("Failed to sum ledger entries"))?;

    Ok(Reconciliation {
        child_id: child_id.to_string(),
        recorded_balance,
        ledger_sum,
        entry_count: entry_count as u64,
        consistent: recorded_balance == ledger_sum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::children::{create_child, CreateChildInput};
    use crate::db::families::{create_family, CreateFamilyInput, FamilyPolicy};

    fn setup() -> LedgerDb {
        let db = LedgerDb::open_in_memory().unwrap();
        db.write(|tx| {
            create_family(
                tx,
                CreateFamilyInput { id: Some("fam".into()), name: "Test".into(), display_name: None },
                "parent",
                FamilyPolicy::default(),
            )?;
            create_child(tx, CreateChildInput {
                id: Some("kid".into()),
                family_id: "fam".into(),
                name: "Kid".into(),
                birth_date: None,
            })
        })
        .unwrap();
        db
    }

    fn credit<'a>(event_id: &'a str, delta: i64) -> Delta<'a> {
        Delta {
            child_id: "kid",
            event_id,
            delta,
            kind: EntryKind::Behavior,
            allow_negative: false,
        }
    }

    #[test]
    fn test_apply_delta_updates_balance() {
        let db = setup();
        assert_eq!(db.apply_delta(credit("e1", 5)).unwrap(), 5);
        assert_eq!(db.apply_delta(credit("e2", 3)).unwrap(), 8);
    }

    #[test]
    fn test_same_event_applied_once() {
        let db = setup();
        db.apply_delta(credit("e1", 5)).unwrap();

        let err = db.apply_delta(credit("e1", 5)).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateApplication(ref id) if id == "e1"));

        let balance = db.with_conn(|conn| balance(conn, "kid")).unwrap();
        assert_eq!(balance, Some(5));
    }

    #[test]
    fn test_negative_balance_refused_unless_allowed() {
        let db = setup();
        db.apply_delta(credit("e1", 2)).unwrap();

        let err = db.apply_delta(credit("e2", -3)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { balance: 2, delta: -3, .. }));

        // Nothing from the failed attempt is left behind
        let applied = db.with_conn(|conn| is_applied(conn, "e2")).unwrap();
        assert!(!applied);

        let allowed = Delta { allow_negative: true, ..credit("e2", -3) };
        assert_eq!(db.apply_delta(allowed).unwrap(), -1);
    }

    #[test]
    fn test_oversized_delta_refused() {
        let db = setup();
        for delta in [0, i64::MAX, i64::MIN] {
            let err = db.apply_delta(credit("huge", delta)).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidInput(_)));
        }

        // Balance stays an integer and later deltas still apply
        assert_eq!(db.apply_delta(credit("e1", 5)).unwrap(), 5);
    }

    #[test]
    fn test_unknown_child() {
        let db = setup();
        let change = Delta { child_id: "ghost", ..credit("e1", 1) };
        assert!(matches!(db.apply_delta(change), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_failure_later_in_transaction_rolls_back_delta() {
        let db = setup();
        let result: Result<(), LedgerError> = db.write(|tx| {
            apply_delta_tx(tx, credit("e1", 10))?;
            Err(LedgerError::Storage("simulated".into()))
        });
        assert!(result.is_err());

        let rec = db.with_conn(|conn| reconcile(conn, "kid")).unwrap();
        assert_eq!(rec.recorded_balance, 0);
        assert_eq!(rec.entry_count, 0);
        assert!(rec.consistent);
    }

    #[test]
    fn test_reconcile_matches_entries() {
        let db = setup();
        db.apply_delta(credit("e1", 7)).unwrap();
        db.apply_delta(Delta { kind: EntryKind::Redemption, ..credit("r1", -4) }).unwrap();
        db.apply_delta(Delta { kind: EntryKind::Refund, ..credit("r1:refund", 4) }).unwrap();

        let rec = db.with_conn(|conn| reconcile(conn, "kid")).unwrap();
        assert_eq!(rec.recorded_balance, 7);
        assert_eq!(rec.ledger_sum, 7);
        assert_eq!(rec.entry_count, 3);
        assert!(rec.consistent);

        let entries = db.with_conn(|conn| entries_for_child(conn, "kid", 10)).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event_id, "r1:refund");
        assert_eq!(entries[0].kind, EntryKind::Refund);
    }
}
