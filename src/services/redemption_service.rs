//! Reward redemption processor
//!
//! Points are debited when the redemption is requested, in the same
//! transaction that creates the row, so a child can never hold two
//! redemptions funded by the same points. A rejected redemption is credited
//! back under `<id>:refund`, which keeps the refund single-shot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::ledger::{apply_delta_tx, refund_event_id, Delta, EntryKind};
use crate::db::redemptions::{self, NewRedemption, RedemptionRow, RedemptionStatus};
use crate::db::{children, families, rewards, LedgerDb};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};
use super::membership::{self, Action};

/// Input for redeeming a reward
#[derive(Debug, Clone, Deserialize)]
pub struct RedeemInput {
    /// Idempotency key; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub child_id: String,
    pub reward_id: String,
}

/// Result of a redemption request or decision
#[derive(Debug, Clone, Serialize)]
pub struct RedemptionOutcome {
    pub redemption: RedemptionRow,
    /// Child balance after this call
    pub balance: i64,
    /// False when the stored redemption was returned without changes
    pub changed: bool,
}

/// Redemption service
pub struct RedemptionService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl RedemptionService {
    /// Create a new redemption service
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Get a redemption visible to `viewer_id`
    pub fn get(&self, id: &str, viewer_id: &str) -> Result<RedemptionRow, LedgerError> {
        self.db.with_conn(|conn| {
            let redemption = redemptions::get_redemption(conn, id)?
                .ok_or_else(|| LedgerError::NotFound(format!("redemption {}", id)))?;
            let child = children::require_child(conn, &redemption.child_id)?;
            membership::require_member(conn, viewer_id, &child.family_id)?;
            Ok(redemption)
        })
    }

    /// List redemptions of a child, newest first
    pub fn list_for_child(
        &self,
        child_id: &str,
        viewer_id: &str,
        limit: i64,
    ) -> Result<Vec<RedemptionRow>, LedgerError> {
        self.db.with_conn(|conn| {
            let child = children::require_child(conn, child_id)?;
            membership::require_member(conn, viewer_id, &child.family_id)?;
            redemptions::list_for_child(conn, child_id, limit)
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Redeem a reward, debiting its points at request time
    pub fn redeem(
        &self,
        input: RedeemInput,
        requested_by: &str,
    ) -> Result<RedemptionOutcome, LedgerError> {
        let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let outcome = self.db.write(|tx| {
            let child = children::require_child(tx, &input.child_id)?;
            membership::authorize(tx, requested_by, &child.family_id, Action::Redeem)?;

            if let Some(existing) = redemptions::get_redemption(tx, &id)? {
                if existing.child_id == input.child_id && existing.reward_id == input.reward_id {
                    debug!(id = %id, "Redemption already requested, returning stored row");
                    return Ok(RedemptionOutcome {
                        redemption: existing,
                        balance: child.total_points,
                        changed: false,
                    });
                }
                return Err(LedgerError::DuplicateApplication(id.clone()));
            }

            let reward = rewards::get_reward(tx, &input.reward_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("reward {}", input.reward_id)))?;
            if reward.family_id != child.family_id {
                return Err(LedgerError::ChildNotInFamily {
                    child_id: child.id.clone(),
                    family_id: reward.family_id.clone(),
                });
            }
            if !reward.active {
                return Err(LedgerError::InvalidState(format!(
                    "reward {} is not active",
                    reward.id
                )));
            }

            let policy = families::require_family(tx, &child.family_id)?.policy;
            let status = if policy.auto_complete_redemptions {
                RedemptionStatus::Completed
            } else {
                RedemptionStatus::Pending
            };

            redemptions::insert_redemption(
                tx,
                &NewRedemption {
                    id: &id,
                    child_id: &child.id,
                    reward_id: &reward.id,
                    points: reward.points_required,
                    requested_by,
                    status,
                },
            )?;

            let balance = apply_delta_tx(
                tx,
                Delta {
                    child_id: &child.id,
                    event_id: &id,
                    delta: -reward.points_required,
                    kind: EntryKind::Redemption,
                    allow_negative: false,
                },
            )
            .map_err(|e| match e {
                LedgerError::InsufficientBalance { balance, .. } => LedgerError::InsufficientPoints {
                    balance,
                    required: reward.points_required,
                },
                other => other,
            })?;

            let redemption = redemptions::get_redemption(tx, &id)?
                .ok_or_else(|| LedgerError::Internal("Failed to retrieve redemption".into()))?;

            Ok(RedemptionOutcome { redemption, balance, changed: true })
        })?;

        if outcome.changed {
            let r = &outcome.redemption;
            info!(
                id = %r.id,
                child_id = %r.child_id,
                reward_id = %r.reward_id,
                points = r.points,
                status = %r.status,
                "Redeemed reward"
            );

            self.events.emit(LedgerEvent::RedemptionRequested {
                id: r.id.clone(),
                child_id: r.child_id.clone(),
                reward_id: r.reward_id.clone(),
                points: r.points,
                status: r.status,
            });
            self.events.emit(LedgerEvent::BalanceChanged {
                child_id: r.child_id.clone(),
                event_id: r.id.clone(),
                delta: -r.points,
                balance: outcome.balance,
            });
        }

        Ok(outcome)
    }

    /// Move a redemption to `status`.
    ///
    /// Rejection credits the points back in the same transaction. Asking for
    /// the current status, or deciding a completed/rejected redemption, returns
    /// it unchanged.
    pub fn decide(
        &self,
        redemption_id: &str,
        approver_id: &str,
        status: RedemptionStatus,
    ) -> Result<RedemptionOutcome, LedgerError> {
        let outcome = self.db.write(|tx| {
            let current = redemptions::get_redemption(tx, redemption_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("redemption {}", redemption_id)))?;
            let child = children::require_child(tx, &current.child_id)?;
            membership::authorize(tx, approver_id, &child.family_id, Action::Approve)?;

            if current.status == status || current.status.is_terminal() {
                debug!(id = %redemption_id, status = %current.status, "Redemption already decided");
                return Ok(RedemptionOutcome {
                    redemption: current,
                    balance: child.total_points,
                    changed: false,
                });
            }

            let policy = families::require_family(tx, &child.family_id)?.policy;
            if current.requested_by == approver_id && !policy.allow_self_approval {
                return Err(LedgerError::Unauthorized(
                    "cannot decide a redemption you requested yourself".into(),
                ));
            }

            if !redemptions::transition(tx, redemption_id, current.status, status, approver_id)? {
                let stored = redemptions::get_redemption(tx, redemption_id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("redemption {}", redemption_id)))?;
                return Ok(RedemptionOutcome {
                    redemption: stored,
                    balance: child.total_points,
                    changed: false,
                });
            }

            let balance = if status == RedemptionStatus::Rejected {
                apply_delta_tx(
                    tx,
                    Delta {
                        child_id: &child.id,
                        event_id: &refund_event_id(redemption_id),
                        delta: current.points,
                        kind: EntryKind::Refund,
                        allow_negative: true,
                    },
                )?
            } else {
                child.total_points
            };

            let redemption = redemptions::get_redemption(tx, redemption_id)?
                .ok_or_else(|| LedgerError::Internal("Failed to retrieve redemption".into()))?;

            Ok(RedemptionOutcome { redemption, balance, changed: true })
        })?;

        if outcome.changed {
            let r = &outcome.redemption;
            info!(id = %r.id, status = %r.status, decided_by = %approver_id, "Decided redemption");

            self.events.emit(LedgerEvent::RedemptionDecided {
                id: r.id.clone(),
                child_id: r.child_id.clone(),
                status: r.status,
                decided_by: approver_id.to_string(),
            });
            if r.status == RedemptionStatus::Rejected {
                self.events.emit(LedgerEvent::BalanceChanged {
                    child_id: r.child_id.clone(),
                    event_id: refund_event_id(&r.id),
                    delta: r.points,
                    balance: outcome.balance,
                });
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::families::FamilyPolicy;
    use crate::db::ledger;
    use crate::db::rewards::{update_reward, UpdateRewardInput};
    use crate::services::test_support::{seed, seed_with_policy, with_balance};

    fn redeem_input(id: &str, reward_id: &str) -> RedeemInput {
        RedeemInput {
            id: Some(id.into()),
            child_id: "kid".into(),
            reward_id: reward_id.into(),
        }
    }

    #[test]
    fn test_redeem_debits_and_refuses_overdraw() {
        let services = seed();
        with_balance(&services, 5);

        let first = services.redemptions.redeem(redeem_input("r1", "ice-cream"), "kid-user").unwrap();
        assert_eq!(first.redemption.status, RedemptionStatus::Pending);
        assert_eq!(first.redemption.points, 5);
        assert_eq!(first.balance, 0);

        let err = services
            .redemptions
            .redeem(redeem_input("r2", "ice-cream"), "kid-user")
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientPoints { balance: 0, required: 5 }));

        // No row is left behind by the failed attempt
        let row = services.db.with_conn(|conn| redemptions::get_redemption(conn, "r2")).unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn test_redeem_retry_returns_stored_row() {
        let services = seed();
        with_balance(&services, 10);

        services.redemptions.redeem(redeem_input("r1", "ice-cream"), "kid-user").unwrap();
        let again = services.redemptions.redeem(redeem_input("r1", "ice-cream"), "kid-user").unwrap();

        assert!(!again.changed);
        assert_eq!(again.balance, 5);
    }

    #[test]
    fn test_auto_complete_policy() {
        let services = seed_with_policy(FamilyPolicy {
            auto_complete_redemptions: true,
            ..FamilyPolicy::default()
        });
        with_balance(&services, 5);

        let outcome = services.redemptions.redeem(redeem_input("r1", "ice-cream"), "kid-user").unwrap();
        assert_eq!(outcome.redemption.status, RedemptionStatus::Completed);
        assert!(outcome.redemption.decided_at.is_some());
    }

    #[test]
    fn test_inactive_and_foreign_rewards() {
        let services = seed();
        with_balance(&services, 50);

        let err = services
            .redemptions
            .redeem(redeem_input("r1", "other-family-reward"), "kid-user")
            .unwrap_err();
        assert!(matches!(err, LedgerError::ChildNotInFamily { .. }));

        services
            .db
            .write(|tx| {
                update_reward(tx, "ice-cream", UpdateRewardInput {
                    active: Some(false),
                    ..UpdateRewardInput::default()
                })
            })
            .unwrap();
        let err = services.redemptions.redeem(redeem_input("r2", "ice-cream"), "kid-user").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[test]
    fn test_reject_refunds_exactly_once() {
        let services = seed();
        with_balance(&services, 5);
        services.redemptions.redeem(redeem_input("r1", "ice-cream"), "kid-user").unwrap();

        let rejected = services.redemptions.decide("r1", "mom", RedemptionStatus::Rejected).unwrap();
        assert!(rejected.changed);
        assert_eq!(rejected.balance, 5);

        let again = services.redemptions.decide("r1", "mom", RedemptionStatus::Rejected).unwrap();
        assert!(!again.changed);
        assert_eq!(again.balance, 5);

        let refunded = services
            .db
            .with_conn(|conn| ledger::is_applied(conn, &refund_event_id("r1")))
            .unwrap();
        assert!(refunded);

        let rec = services.db.with_conn(|conn| ledger::reconcile(conn, "kid")).unwrap();
        assert!(rec.consistent);
    }

    #[test]
    fn test_approve_then_complete() {
        let services = seed();
        with_balance(&services, 5);
        services.redemptions.redeem(redeem_input("r1", "ice-cream"), "kid-user").unwrap();

        let approved = services.redemptions.decide("r1", "dad", RedemptionStatus::Approved).unwrap();
        assert_eq!(approved.redemption.status, RedemptionStatus::Approved);
        assert_eq!(approved.balance, 0);

        let err = services.redemptions.decide("r1", "dad", RedemptionStatus::Rejected).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));

        let completed = services.redemptions.decide("r1", "dad", RedemptionStatus::Completed).unwrap();
        assert_eq!(completed.redemption.status, RedemptionStatus::Completed);
        assert_eq!(completed.balance, 0);
    }

    #[test]
    fn test_self_decision_and_role_checks() {
        let services = seed();
        with_balance(&services, 10);
        services.redemptions.redeem(redeem_input("r1", "ice-cream"), "mom").unwrap();

        let err = services.redemptions.decide("r1", "mom", RedemptionStatus::Approved).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let err = services
            .redemptions
            .decide("r1", "kid-user", RedemptionStatus::Approved)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        assert!(services.redemptions.decide("r1", "dad", RedemptionStatus::Approved).unwrap().changed);
    }
}
