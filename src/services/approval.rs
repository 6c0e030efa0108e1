//! Approval workflow for pending behavior events
//!
//! ```text
//! pending ──► verified   (points applied once, keyed by the event id)
//!    └──────► rejected   (no ledger effect)
//! ```
//!
//! Both targets are terminal. Deciding a terminal event again is a read that
//! returns it unchanged.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::db::behaviors::{self, BehaviorEventRow, VerificationState};
use crate::db::ledger::{apply_delta_tx, Delta, EntryKind};
use crate::db::{children, families, LedgerDb};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};
use super::membership::{self, Action};

/// Outcome of a verification decision
#[derive(Debug, Clone, Serialize)]
pub struct BehaviorDecision {
    pub event: BehaviorEventRow,
    /// Child balance after the decision
    pub balance: i64,
    /// False when the event was already decided and nothing changed
    pub changed: bool,
}

/// Approval service
pub struct ApprovalService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl ApprovalService {
    /// Create a new approval service
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Verify (`approve = true`) or reject a pending behavior event
    pub fn decide(
        &self,
        event_id: &str,
        approver_id: &str,
        approve: bool,
    ) -> Result<BehaviorDecision, LedgerError> {
        let decision = self.db.write(|tx| {
            let event = behaviors::get_behavior(tx, event_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("behavior event {}", event_id)))?;
            let child = children::require_child(tx, &event.child_id)?;
            membership::authorize(tx, approver_id, &child.family_id, Action::Approve)?;

            if event.verification_state.is_terminal() {
                debug!(id = %event_id, state = %event.verification_state, "Event already decided");
                return Ok(BehaviorDecision {
                    event,
                    balance: child.total_points,
                    changed: false,
                });
            }

            let policy = families::require_family(tx, &child.family_id)?.policy;
            if event.created_by == approver_id && !policy.allow_self_approval {
                return Err(LedgerError::Unauthorized(
                    "cannot decide a behavior you recorded yourself".into(),
                ));
            }

            let target = if approve {
                VerificationState::Verified
            } else {
                VerificationState::Rejected
            };

            if !behaviors::mark_decided(tx, event_id, target, approver_id)? {
                // Someone else decided first; report what they stored
                let stored = behaviors::get_behavior(tx, event_id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("behavior event {}", event_id)))?;
                return Ok(BehaviorDecision {
                    event: stored,
                    balance: child.total_points,
                    changed: false,
                });
            }

            let balance = if approve {
                apply_delta_tx(
                    tx,
                    Delta {
                        child_id: &child.id,
                        event_id,
                        delta: event.points,
                        kind: EntryKind::Behavior,
                        allow_negative: policy.allow_negative_balance || event.points > 0,
                    },
                )?
            } else {
                child.total_points
            };

            let event = behaviors::get_behavior(tx, event_id)?
                .ok_or_else(|| LedgerError::Internal("Failed to retrieve decided behavior".into()))?;

            Ok(BehaviorDecision { event, balance, changed: true })
        })?;

        if decision.changed {
            let event = &decision.event;
            info!(
                id = %event.id,
                state = %event.verification_state,
                decided_by = %approver_id,
                "Decided behavior event"
            );

            self.events.emit(LedgerEvent::BehaviorDecided {
                id: event.id.clone(),
                child_id: event.child_id.clone(),
                state: event.verification_state,
                decided_by: approver_id.to_string(),
            });
            if event.verification_state == VerificationState::Verified {
                self.events.emit(LedgerEvent::BalanceChanged {
                    child_id: event.child_id.clone(),
                    event_id: event.id.clone(),
                    delta: event.points,
                    balance: decision.balance,
                });
            }
        }

        Ok(decision)
    }
}
