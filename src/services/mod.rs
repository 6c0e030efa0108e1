//! Service layer for family-points
//!
//! Services hold the business rules between HTTP handlers and repositories.
//! Each mutating operation runs its membership check, its row writes and its
//! ledger application in one write transaction, then emits events once the
//! transaction has committed.
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin, spawn_blocking)
//!     ↓
//! Service Layer (guard + workflow + events)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod response;
pub mod events;
pub mod retry;
pub mod membership;
pub mod behavior_service;
pub mod approval;
pub mod redemption_service;
pub mod family_service;

// Re-exports
pub use approval::{ApprovalService, BehaviorDecision};
pub use behavior_service::{BehaviorService, RecordBehaviorInput, RecordedBehavior};
pub use events::{EventBus, LedgerEvent, Subscription};
pub use family_service::{FamilyService, LedgerView};
pub use membership::{authorize, role_permits, Action};
pub use redemption_service::{RedeemInput, RedemptionOutcome, RedemptionService};
pub use retry::{with_retry, RetryPolicy};

use std::sync::Arc;

use crate::db::{FamilyPolicy, LedgerDb};

/// Service container for dependency injection
///
/// Holds all services with a shared database handle and event bus.
/// Pass this to HttpServer for handler access.
pub struct Services {
    pub db: Arc<LedgerDb>,
    pub families: Arc<FamilyService>,
    pub behaviors: Arc<BehaviorService>,
    pub approval: Arc<ApprovalService>,
    pub redemptions: Arc<RedemptionService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services with a shared database; new families get `default_policy`
    pub fn new(db: Arc<LedgerDb>, default_policy: FamilyPolicy) -> Self {
        let events = Arc::new(EventBus::new());

        Self {
            families: Arc::new(FamilyService::new(db.clone(), events.clone(), default_policy)),
            behaviors: Arc::new(BehaviorService::new(db.clone(), events.clone())),
            approval: Arc::new(ApprovalService::new(db.clone(), events.clone())),
            redemptions: Arc::new(RedemptionService::new(db.clone(), events.clone())),
            db,
            events,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixture: family `fam` with parent `mom`, guardian `dad`, member
    //! `kid-user`, child `kid`, rules `clean-room` (+5) and `hit-sibling` (-3),
    //! reward `ice-cream` (5). A second family `other` owns
    //! `other-family-rule` and `other-family-reward`.

    use super::*;
    use crate::db::children::{create_child, CreateChildInput};
    use crate::db::families::{add_member, create_family, AddMemberInput, CreateFamilyInput, Role};
    use crate::db::ledger::{Delta, EntryKind};
    use crate::db::rewards::{create_reward, CreateRewardInput};
    use crate::db::rules::{create_rule, CreateRuleInput};
    use crate::db::RuleType;

    pub fn seed() -> Services {
        seed_with_policy(FamilyPolicy::default())
    }

    pub fn seed_with_policy(policy: FamilyPolicy) -> Services {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());

        db.write(|tx| {
            create_family(
                tx,
                CreateFamilyInput { id: Some("fam".into()), name: "Family".into(), display_name: None },
                "mom",
                policy,
            )?;
            add_member(tx, "fam", AddMemberInput {
                user_id: "dad".into(),
                role: Role::Guardian,
                display_name: None,
            })?;
            add_member(tx, "fam", AddMemberInput {
                user_id: "kid-user".into(),
                role: Role::Member,
                display_name: None,
            })?;
            create_child(tx, CreateChildInput {
                id: Some("kid".into()),
                family_id: "fam".into(),
                name: "Kid".into(),
                birth_date: None,
            })?;
            create_rule(tx, CreateRuleInput {
                id: Some("clean-room".into()),
                family_id: "fam".into(),
                name: "Clean room".into(),
                description: None,
                rule_type: RuleType::Reward,
                points: 5,
            })?;
            create_rule(tx, CreateRuleInput {
                id: Some("hit-sibling".into()),
                family_id: "fam".into(),
                name: "Hit sibling".into(),
                description: None,
                rule_type: RuleType::Punishment,
                points: 3,
            })?;
            create_reward(tx, CreateRewardInput {
                id: Some("ice-cream".into()),
                family_id: "fam".into(),
                name: "Ice cream".into(),
                description: None,
                points_required: 5,
                image_url: None,
            })?;

            create_family(
                tx,
                CreateFamilyInput { id: Some("other".into()), name: "Other".into(), display_name: None },
                "neighbor",
                FamilyPolicy::default(),
            )?;
            create_rule(tx, CreateRuleInput {
                id: Some("other-family-rule".into()),
                family_id: "other".into(),
                name: "Other rule".into(),
                description: None,
                rule_type: RuleType::Reward,
                points: 1,
            })?;
            create_reward(tx, CreateRewardInput {
                id: Some("other-family-reward".into()),
                family_id: "other".into(),
                name: "Other reward".into(),
                description: None,
                points_required: 1,
                image_url: None,
            })?;
            Ok(())
        })
        .unwrap();

        Services::new(db, FamilyPolicy::default())
    }

    /// Credit `kid` directly through the ledger
    pub fn with_balance(services: &Services, points: i64) {
        services
            .db
            .apply_delta(Delta {
                child_id: "kid",
                event_id: "seed-balance",
                delta: points,
                kind: EntryKind::Behavior,
                allow_negative: false,
            })
            .unwrap();
    }
}
