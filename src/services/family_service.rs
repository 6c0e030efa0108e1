//! Family service - setup and read views
//!
//! Families, members, children, rules and rewards. Every write needs the
//! `manage` action; reads need any membership in the family.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::db::children::{self, ChildRow, CreateChildInput};
use crate::db::families::{self, AddMemberInput, CreateFamilyInput, FamilyMemberRow, FamilyPolicy, FamilyRow};
use crate::db::ledger::{self, LedgerEntryRow, Reconciliation};
use crate::db::rewards::{self, CreateRewardInput, RewardRow, UpdateRewardInput};
use crate::db::rules::{self, CreateRuleInput, RuleRow, UpdateRuleInput};
use crate::db::LedgerDb;
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};
use super::membership::{self, Action};

/// A child's ledger history with its reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct LedgerView {
    pub child: ChildRow,
    pub entries: Vec<LedgerEntryRow>,
    pub reconciliation: Reconciliation,
}

/// Family service
pub struct FamilyService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    default_policy: FamilyPolicy,
}

impl FamilyService {
    /// Create a new family service; new families start with `default_policy`
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>, default_policy: FamilyPolicy) -> Self {
        Self { db, events, default_policy }
    }

    // =========================================================================
    // Families and members
    // =========================================================================

    /// Create a family; the creator becomes its first parent
    pub fn create_family(
        &self,
        input: CreateFamilyInput,
        creator_id: &str,
    ) -> Result<FamilyRow, LedgerError> {
        let family = self
            .db
            .write(|tx| families::create_family(tx, input, creator_id, self.default_policy))?;

        info!(id = %family.id, creator = %creator_id, "Created family");
        Ok(family)
    }

    /// Get a family visible to `viewer_id`
    pub fn get_family(&self, family_id: &str, viewer_id: &str) -> Result<FamilyRow, LedgerError> {
        self.db.with_conn(|conn| {
            let family = families::require_family(conn, family_id)?;
            membership::require_member(conn, viewer_id, family_id)?;
            Ok(family)
        })
    }

    /// Replace the policy flags of a family
    pub fn update_policy(
        &self,
        family_id: &str,
        actor_id: &str,
        policy: FamilyPolicy,
    ) -> Result<FamilyRow, LedgerError> {
        let family = self.db.write(|tx| {
            families::require_family(tx, family_id)?;
            membership::authorize(tx, actor_id, family_id, Action::Manage)?;
            families::update_policy(tx, family_id, policy)
        })?;

        info!(id = %family_id, policy = ?family.policy, "Updated family policy");
        Ok(family)
    }

    /// Add a member or change an existing member's role
    pub fn add_member(
        &self,
        family_id: &str,
        actor_id: &str,
        input: AddMemberInput,
    ) -> Result<FamilyMemberRow, LedgerError> {
        let member = self.db.write(|tx| {
            families::require_family(tx, family_id)?;
            membership::authorize(tx, actor_id, family_id, Action::Manage)?;
            families::add_member(tx, family_id, input)
        })?;

        info!(family_id = %family_id, user_id = %member.user_id, role = %member.role, "Added family member");
        Ok(member)
    }

    /// List members of a family
    pub fn list_members(
        &self,
        family_id: &str,
        viewer_id: &str,
    ) -> Result<Vec<FamilyMemberRow>, LedgerError> {
        self.db.with_conn(|conn| {
            membership::require_member(conn, viewer_id, family_id)?;
            families::list_members(conn, family_id)
        })
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Add a child with a zero balance
    pub fn add_child(&self, input: CreateChildInput, actor_id: &str) -> Result<ChildRow, LedgerError> {
        let child = self.db.write(|tx| {
            families::require_family(tx, &input.family_id)?;
            membership::authorize(tx, actor_id, &input.family_id, Action::Manage)?;
            children::create_child(tx, input)
        })?;

        info!(id = %child.id, family_id = %child.family_id, "Added child");
        Ok(child)
    }

    /// Remove a child together with its events, redemptions and ledger entries
    pub fn remove_child(&self, child_id: &str, actor_id: &str) -> Result<(), LedgerError> {
        let child = self.db.write(|tx| {
            let child = children::require_child(tx, child_id)?;
            membership::authorize(tx, actor_id, &child.family_id, Action::Manage)?;
            children::delete_child(tx, child_id)?;
            Ok(child)
        })?;

        info!(id = %child.id, family_id = %child.family_id, "Removed child");
        self.events.emit(LedgerEvent::ChildRemoved {
            id: child.id,
            family_id: child.family_id,
        });
        Ok(())
    }

    /// Get a child with its current balance
    pub fn get_child(&self, child_id: &str, viewer_id: &str) -> Result<ChildRow, LedgerError> {
        self.db.with_conn(|conn| {
            let child = children::require_child(conn, child_id)?;
            membership::require_member(conn, viewer_id, &child.family_id)?;
            Ok(child)
        })
    }

    /// List children of a family
    pub fn list_children(&self, family_id: &str, viewer_id: &str) -> Result<Vec<ChildRow>, LedgerError> {
        self.db.with_conn(|conn| {
            membership::require_member(conn, viewer_id, family_id)?;
            children::list_children(conn, family_id)
        })
    }

    /// Ledger history of a child, newest first, with a balance check
    pub fn ledger(&self, child_id: &str, viewer_id: &str, limit: i64) -> Result<LedgerView, LedgerError> {
        self.db.with_conn(|conn| {
            let child = children::require_child(conn, child_id)?;
            membership::require_member(conn, viewer_id, &child.family_id)?;

            let entries = ledger::entries_for_child(conn, child_id, limit)?;
            let reconciliation = ledger::reconcile(conn, child_id)?;
            if !reconciliation.consistent {
                tracing::error!(
                    child_id = %child_id,
                    recorded = reconciliation.recorded_balance,
                    ledger_sum = reconciliation.ledger_sum,
                    "Balance does not match ledger entries"
                );
            }

            Ok(LedgerView { child, entries, reconciliation })
        })
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Create a rule
    pub fn create_rule(&self, input: CreateRuleInput, actor_id: &str) -> Result<RuleRow, LedgerError> {
        let rule = self.db.write(|tx| {
            families::require_family(tx, &input.family_id)?;
            membership::authorize(tx, actor_id, &input.family_id, Action::Manage)?;
            rules::create_rule(tx, input)
        })?;

        info!(id = %rule.id, rule_type = %rule.rule_type, points = rule.points, "Created rule");
        Ok(rule)
    }

    /// Edit a rule; only behaviors recorded afterwards see the change
    pub fn update_rule(
        &self,
        rule_id: &str,
        actor_id: &str,
        input: UpdateRuleInput,
    ) -> Result<RuleRow, LedgerError> {
        self.db.write(|tx| {
            let rule = rules::get_rule(tx, rule_id)?
                .ok_or_else(|| LedgerError::RuleNotFound(rule_id.to_string()))?;
            membership::authorize(tx, actor_id, &rule.family_id, Action::Manage)?;
            rules::update_rule(tx, rule_id, input)
        })
    }

    /// Activate or deactivate a rule
    pub fn set_rule_active(&self, rule_id: &str, actor_id: &str, active: bool) -> Result<RuleRow, LedgerError> {
        self.update_rule(
            rule_id,
            actor_id,
            UpdateRuleInput {
                active: Some(active),
                ..UpdateRuleInput::default()
            },
        )
    }

    /// List rules of a family
    pub fn list_rules(
        &self,
        family_id: &str,
        viewer_id: &str,
        active_only: bool,
    ) -> Result<Vec<RuleRow>, LedgerError> {
        self.db.with_conn(|conn| {
            membership::require_member(conn, viewer_id, family_id)?;
            rules::list_rules(conn, family_id, active_only)
        })
    }

    // =========================================================================
    // Rewards
    // =========================================================================

    /// Create a reward
    pub fn create_reward(&self, input: CreateRewardInput, actor_id: &str) -> Result<RewardRow, LedgerError> {
        let reward = self.db.write(|tx| {
            families::require_family(tx, &input.family_id)?;
            membership::authorize(tx, actor_id, &input.family_id, Action::Manage)?;
            rewards::create_reward(tx, input)
        })?;

        info!(id = %reward.id, points_required = reward.points_required, "Created reward");
        Ok(reward)
    }

    /// Edit a reward; existing redemptions keep their point snapshot
    pub fn update_reward(
        &self,
        reward_id: &str,
        actor_id: &str,
        input: UpdateRewardInput,
    ) -> Result<RewardRow, LedgerError> {
        self.db.write(|tx| {
            let reward = rewards::get_reward(tx, reward_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("reward {}", reward_id)))?;
            membership::authorize(tx, actor_id, &reward.family_id, Action::Manage)?;
            rewards::update_reward(tx, reward_id, input)
        })
    }

    /// Activate or deactivate a reward
    pub fn set_reward_active(
        &self,
        reward_id: &str,
        actor_id: &str,
        active: bool,
    ) -> Result<RewardRow, LedgerError> {
        self.update_reward(
            reward_id,
            actor_id,
            UpdateRewardInput {
                active: Some(active),
                ..UpdateRewardInput::default()
            },
        )
    }

    /// List rewards of a family
    pub fn list_rewards(
        &self,
        family_id: &str,
        viewer_id: &str,
        active_only: bool,
    ) -> Result<Vec<RewardRow>, LedgerError> {
        self.db.with_conn(|conn| {
            membership::require_member(conn, viewer_id, family_id)?;
            rewards::list_rewards(conn, family_id, active_only)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::families::Role;
    use crate::db::RuleType;
    use crate::services::behavior_service::RecordBehaviorInput;
    use crate::services::test_support::{seed, with_balance};

    #[test]
    fn test_creator_becomes_parent() {
        let services = seed();
        let family = services
            .families
            .create_family(
                CreateFamilyInput { id: None, name: "Smiths".into(), display_name: None },
                "alice",
            )
            .unwrap();

        let members = services.families.list_members(&family.id, "alice").unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, Role::Parent);
        assert!(!family.policy.allow_self_approval);
    }

    #[test]
    fn test_guardian_cannot_manage() {
        let services = seed();
        let err = services
            .families
            .add_child(
                CreateChildInput {
                    id: None,
                    family_id: "fam".into(),
                    name: "Second".into(),
                    birth_date: None,
                },
                "dad",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let err = services
            .families
            .update_policy("fam", "dad", FamilyPolicy::default())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));
    }

    #[test]
    fn test_add_member_and_policy() {
        let services = seed();
        let member = services
            .families
            .add_member("fam", "mom", AddMemberInput {
                user_id: "grandma".into(),
                role: Role::Guardian,
                display_name: Some("Grandma".into()),
            })
            .unwrap();
        assert_eq!(member.role, Role::Guardian);

        let family = services
            .families
            .update_policy("fam", "mom", FamilyPolicy {
                verify_rewards: true,
                ..FamilyPolicy::default()
            })
            .unwrap();
        assert!(family.policy.verify_rewards);
        assert!(services.families.get_family("fam", "grandma").unwrap().policy.verify_rewards);
    }

    #[test]
    fn test_remove_child_cascades() {
        let services = seed();
        with_balance(&services, 5);
        services
            .behaviors
            .record(
                RecordBehaviorInput {
                    id: Some("b1".into()),
                    child_id: "kid".into(),
                    rule_id: "clean-room".into(),
                    note: Some("tidy".into()),
                },
                "mom",
            )
            .unwrap();

        services.families.remove_child("kid", "mom").unwrap();

        let stats = services.db.stats().unwrap();
        assert_eq!(stats.child_count, 0);
        assert_eq!(stats.behavior_count, 0);
        assert_eq!(stats.ledger_entry_count, 0);

        let err = services.families.get_child("kid", "mom").unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn test_ledger_view_reconciles() {
        let services = seed();
        with_balance(&services, 7);

        let view = services.families.ledger("kid", "kid-user", 50).unwrap();
        assert_eq!(view.child.total_points, 7);
        assert_eq!(view.entries.len(), 1);
        assert!(view.reconciliation.consistent);

        let err = services.families.ledger("kid", "stranger", 50).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));
    }

    #[test]
    fn test_rule_lifecycle() {
        let services = seed();
        let rule = services
            .families
            .create_rule(
                CreateRuleInput {
                    id: None,
                    family_id: "fam".into(),
                    name: "Talk back".into(),
                    description: None,
                    rule_type: RuleType::Punishment,
                    points: 2,
                },
                "mom",
            )
            .unwrap();
        assert_eq!(rule.points, -2);

        let rule = services.families.set_rule_active(&rule.id, "mom", false).unwrap();
        assert!(!rule.active);

        let active = services.families.list_rules("fam", "dad", true).unwrap();
        assert!(active.iter().all(|r| r.id != rule.id));

        let err = services.families.set_rule_active("missing", "mom", true).unwrap_err();
        assert!(matches!(err, LedgerError::RuleNotFound(_)));
    }

    #[test]
    fn test_reward_lifecycle() {
        let services = seed();
        let reward = services
            .families
            .create_reward(
                CreateRewardInput {
                    id: None,
                    family_id: "fam".into(),
                    name: "Movie night".into(),
                    description: None,
                    points_required: 20,
                    image_url: None,
                },
                "mom",
            )
            .unwrap();

        let reward = services.families.set_reward_active(&reward.id, "mom", false).unwrap();
        assert!(!reward.active);

        let listed = services.families.list_rewards("fam", "kid-user", false).unwrap();
        assert!(listed.iter().any(|r| r.id == reward.id));
    }
}
