//! Shared setup for integration tests
//!
//! Family `fam`: parent `mom`, guardian `dad`, member `kid-user`, child `kid`,
//! rules `clean-room` (+5) and `hit-sibling` (-3), reward `ice-cream` (5).

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use family_points::db::children::CreateChildInput;
use family_points::db::families::{AddMemberInput, CreateFamilyInput, FamilyPolicy, Role};
use family_points::db::rewards::CreateRewardInput;
use family_points::db::rules::CreateRuleInput;
use family_points::db::RuleType;
use family_points::services::{RecordBehaviorInput, RedeemInput};
use family_points::{LedgerDb, Services};

pub fn in_memory(policy: FamilyPolicy) -> Services {
    let db = Arc::new(LedgerDb::open_in_memory().unwrap());
    let services = Services::new(db, policy);
    seed(&services);
    services
}

pub fn open_file(path: &Path, policy: FamilyPolicy) -> Services {
    let db = Arc::new(LedgerDb::open(path, std::time::Duration::from_secs(10)).unwrap());
    Services::new(db, policy)
}

pub fn seed(services: &Services) {
    let families = &services.families;

    families
        .create_family(
            CreateFamilyInput { id: Some("fam".into()), name: "Family".into(), display_name: None },
            "mom",
        )
        .unwrap();
    for (user, role) in [("dad", Role::Guardian), ("kid-user", Role::Member)] {
        families
            .add_member("fam", "mom", AddMemberInput {
                user_id: user.into(),
                role,
                display_name: None,
            })
            .unwrap();
    }
    families
        .add_child(
            CreateChildInput {
                id: Some("kid".into()),
                family_id: "fam".into(),
                name: "Kid".into(),
                birth_date: Some("2016-04-01".into()),
            },
            "mom",
        )
        .unwrap();
    families
        .create_rule(
            CreateRuleInput {
                id: Some("clean-room".into()),
                family_id: "fam".into(),
                name: "Clean room".into(),
                description: None,
                rule_type: RuleType::Reward,
                points: 5,
            },
            "mom",
        )
        .unwrap();
    families
        .create_rule(
            CreateRuleInput {
                id: Some("hit-sibling".into()),
                family_id: "fam".into(),
                name: "Hit sibling".into(),
                description: None,
                rule_type: RuleType::Punishment,
                points: 3,
            },
            "mom",
        )
        .unwrap();
    families
        .create_reward(
            CreateRewardInput {
                id: Some("ice-cream".into()),
                family_id: "fam".into(),
                name: "Ice cream".into(),
                description: None,
                points_required: 5,
                image_url: None,
            },
            "mom",
        )
        .unwrap();
}

pub fn behavior(id: &str, rule_id: &str) -> RecordBehaviorInput {
    RecordBehaviorInput {
        id: Some(id.into()),
        child_id: "kid".into(),
        rule_id: rule_id.into(),
        note: None,
    }
}

pub fn redemption(id: &str) -> RedeemInput {
    RedeemInput {
        id: Some(id.into()),
        child_id: "kid".into(),
        reward_id: "ice-cream".into(),
    }
}
