//! Behavior recorder - records behaviors against family rules
//!
//! The rule's points are copied onto the event at recording time, so later
//! rule edits never change what an event is worth. Whether the points land
//! immediately or wait for a decision depends on the family policy for the
//! rule's classification.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::behaviors::{self, BehaviorEventRow, NewBehaviorEvent, VerificationState};
use crate::db::ledger::{apply_delta_tx, Delta, EntryKind};
use crate::db::{children, families, rules, LedgerDb, RuleType};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};
use super::membership::{self, Action};

/// Input for recording a behavior
#[derive(Debug, Clone, Deserialize)]
pub struct RecordBehaviorInput {
    /// Idempotency key; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub child_id: String,
    pub rule_id: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Result of recording a behavior
#[derive(Debug, Clone, Serialize)]
pub struct RecordedBehavior {
    pub event: BehaviorEventRow,
    /// Child balance after this call
    pub balance: i64,
    /// True when the id was already recorded and the stored event was returned
    pub replayed: bool,
}

/// Behavior service
pub struct BehaviorService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl BehaviorService {
    /// Create a new behavior service
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Get a behavior event visible to `viewer_id`
    pub fn get(&self, id: &str, viewer_id: &str) -> Result<BehaviorEventRow, LedgerError> {
        self.db.with_conn(|conn| {
            let event = behaviors::get_behavior(conn, id)?
                .ok_or_else(|| LedgerError::NotFound(format!("behavior event {}", id)))?;
            let child = children::require_child(conn, &event.child_id)?;
            membership::require_member(conn, viewer_id, &child.family_id)?;
            Ok(event)
        })
    }

    /// List behavior events of a child, newest first
    pub fn list_for_child(
        &self,
        child_id: &str,
        viewer_id: &str,
        state: Option<VerificationState>,
        limit: i64,
    ) -> Result<Vec<BehaviorEventRow>, LedgerError> {
        self.db.with_conn(|conn| {
            let child = children::require_child(conn, child_id)?;
            membership::require_member(conn, viewer_id, &child.family_id)?;
            behaviors::list_for_child(conn, child_id, state, limit)
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Record a behavior for a child.
    ///
    /// The event insert and, when no verification is required, the ledger
    /// application run in one transaction. Retrying with the same id returns
    /// the stored event without applying anything again.
    pub fn record(
        &self,
        input: RecordBehaviorInput,
        recorded_by: &str,
    ) -> Result<RecordedBehavior, LedgerError> {
        let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let recorded = self.db.write(|tx| {
            let child = children::require_child(tx, &input.child_id)?;
            membership::authorize(tx, recorded_by, &child.family_id, Action::Record)?;

            if let Some(existing) = behaviors::get_behavior(tx, &id)? {
                if existing.child_id == input.child_id && existing.rule_id == input.rule_id {
                    debug!(id = %id, "Behavior already recorded, returning stored event");
                    return Ok(RecordedBehavior {
                        event: existing,
                        balance: child.total_points,
                        replayed: true,
                    });
                }
                return Err(LedgerError::DuplicateApplication(id.clone()));
            }

            let rule = rules::get_rule(tx, &input.rule_id)?
                .ok_or_else(|| LedgerError::RuleNotFound(input.rule_id.clone()))?;
            if rule.family_id != child.family_id {
                return Err(LedgerError::ChildNotInFamily {
                    child_id: child.id.clone(),
                    family_id: rule.family_id.clone(),
                });
            }
            if !rule.active {
                return Err(LedgerError::RuleInactive(rule.id.clone()));
            }

            let policy = families::require_family(tx, &child.family_id)?.policy;
            let needs_verification = match rule.rule_type {
                RuleType::Reward => policy.verify_rewards,
                RuleType::Punishment => policy.verify_punishments,
            };
            let state = if needs_verification {
                VerificationState::Pending
            } else {
                VerificationState::Verified
            };

            behaviors::insert_behavior(
                tx,
                &NewBehaviorEvent {
                    id: &id,
                    child_id: &child.id,
                    rule_id: &rule.id,
                    points: rule.points,
                    note: input.note.as_deref(),
                    created_by: recorded_by,
                    verification_state: state,
                },
            )?;

            let balance = if state == VerificationState::Verified {
                apply_delta_tx(
                    tx,
                    Delta {
                        child_id: &child.id,
                        event_id: &id,
                        delta: rule.points,
                        kind: EntryKind::Behavior,
                        allow_negative: policy.allow_negative_balance || rule.points > 0,
                    },
                )?
            } else {
                child.total_points
            };

            let event = behaviors::get_behavior(tx, &id)?
                .ok_or_else(|| LedgerError::Internal("Failed to retrieve recorded behavior".into()))?;

            Ok(RecordedBehavior { event, balance, replayed: false })
        })?;

        if !recorded.replayed {
            let event = &recorded.event;
            info!(
                id = %event.id,
                child_id = %event.child_id,
                points = event.points,
                state = %event.verification_state,
                "Recorded behavior"
            );

            self.events.emit(LedgerEvent::BehaviorRecorded {
                id: event.id.clone(),
                child_id: event.child_id.clone(),
                points: event.points,
                state: event.verification_state,
            });
            if event.verification_state == VerificationState::Verified {
                self.events.emit(LedgerEvent::BalanceChanged {
                    child_id: event.child_id.clone(),
                    event_id: event.id.clone(),
                    delta: event.points,
                    balance: recorded.balance,
                });
            }
        }

        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::families::FamilyPolicy;
    use crate::db::ledger;
    use crate::db::rules::{update_rule, UpdateRuleInput};
    use crate::services::test_support::{seed, seed_with_policy};

    fn input(id: &str, rule_id: &str) -> RecordBehaviorInput {
        RecordBehaviorInput {
            id: Some(id.into()),
            child_id: "kid".into(),
            rule_id: rule_id.into(),
            note: None,
        }
    }

    #[test]
    fn test_unverified_reward_applies_immediately() {
        let services = seed();
        let recorded = services.behaviors.record(input("b1", "clean-room"), "mom").unwrap();

        assert_eq!(recorded.event.verification_state, VerificationState::Verified);
        assert_eq!(recorded.event.verified_by.as_deref(), Some("mom"));
        assert_eq!(recorded.event.points, 5);
        assert_eq!(recorded.balance, 5);
        assert!(!recorded.replayed);
    }

    #[test]
    fn test_verified_policy_leaves_event_pending() {
        let services = seed_with_policy(FamilyPolicy {
            verify_rewards: true,
            ..FamilyPolicy::default()
        });
        let recorded = services.behaviors.record(input("b1", "clean-room"), "dad").unwrap();

        assert_eq!(recorded.event.verification_state, VerificationState::Pending);
        assert_eq!(recorded.balance, 0);

        let applied = services.db.with_conn(|conn| ledger::is_applied(conn, "b1")).unwrap();
        assert!(!applied);
    }

    #[test]
    fn test_retry_returns_stored_event() {
        let services = seed();
        services.behaviors.record(input("b1", "clean-room"), "mom").unwrap();
        let again = services.behaviors.record(input("b1", "clean-room"), "mom").unwrap();

        assert!(again.replayed);
        assert_eq!(again.balance, 5);

        let err = services.behaviors.record(input("b1", "hit-sibling"), "mom").unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateApplication(_)));
    }

    #[test]
    fn test_rule_checks() {
        let services = seed();

        let err = services.behaviors.record(input("b1", "nope"), "mom").unwrap_err();
        assert!(matches!(err, LedgerError::RuleNotFound(_)));

        let err = services.behaviors.record(input("b2", "other-family-rule"), "mom").unwrap_err();
        assert!(matches!(err, LedgerError::ChildNotInFamily { .. }));

        services
            .db
            .write(|tx| {
                update_rule(tx, "clean-room", UpdateRuleInput {
                    active: Some(false),
                    ..UpdateRuleInput::default()
                })
            })
            .unwrap();
        let err = services.behaviors.record(input("b3", "clean-room"), "mom").unwrap_err();
        assert!(matches!(err, LedgerError::RuleInactive(_)));
    }

    #[test]
    fn test_member_cannot_record() {
        let services = seed();
        let err = services.behaviors.record(input("b1", "clean-room"), "kid-user").unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let err = services.behaviors.record(input("b2", "clean-room"), "stranger").unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));
    }

    #[test]
    fn test_rule_edit_does_not_change_recorded_points() {
        let services = seed();
        services.behaviors.record(input("b1", "clean-room"), "mom").unwrap();

        services
            .db
            .write(|tx| {
                update_rule(tx, "clean-room", UpdateRuleInput {
                    points: Some(50),
                    ..UpdateRuleInput::default()
                })
            })
            .unwrap();

        let event = services.behaviors.get("b1", "kid-user").unwrap();
        assert_eq!(event.points, 5);

        let second = services.behaviors.record(input("b2", "clean-room"), "mom").unwrap();
        assert_eq!(second.event.points, 50);
        assert_eq!(second.balance, 55);
    }

    #[test]
    fn test_punishment_may_go_negative_by_default() {
        let services = seed();
        let recorded = services.behaviors.record(input("b1", "hit-sibling"), "mom").unwrap();
        assert_eq!(recorded.event.points, -3);
        assert_eq!(recorded.balance, -3);
    }

    #[test]
    fn test_punishment_blocked_without_negative_balance() {
        let services = seed_with_policy(FamilyPolicy {
            allow_negative_balance: false,
            ..FamilyPolicy::default()
        });
        let err = services.behaviors.record(input("b1", "hit-sibling"), "mom").unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

        // The event row was rolled back with the failed delta
        let found = services.db.with_conn(|conn| behaviors::get_behavior(conn, "b1")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_events_emitted_after_commit() {
        let services = seed();
        let mut subscription = services.events.subscribe();

        services.behaviors.record(input("b1", "clean-room"), "mom").unwrap();

        assert!(matches!(
            subscription.try_recv(),
            Some(LedgerEvent::BehaviorRecorded { ref id, .. }) if id == "b1"
        ));
        assert!(matches!(
            subscription.try_recv(),
            Some(LedgerEvent::BalanceChanged { balance: 5, .. })
        ));
    }
}
