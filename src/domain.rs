//! Membership domain types the batch computes over, plus the business-rule
//! seam (`BatchRules`) the orchestrator calls into.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::ChunkKey;

/// A member whose badges, tier and coupons are recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: i64,
    /// Badge categories the member is tracked against.
    pub category_ids: Vec<i64>,
}

impl Subject {
    pub fn new(user_id: i64, category_ids: Vec<i64>) -> Self {
        Self {
            user_id,
            category_ids,
        }
    }

    /// Badge work items for this subject, in category order.
    pub fn badge_keys(&self) -> impl Iterator<Item = SubjectKey> + '_ {
        let mut categories = self.category_ids.clone();
        categories.sort_unstable();
        categories.dedup();
        categories.into_iter().map(|category_id| SubjectKey {
            user_id: self.user_id,
            category_id,
        })
    }
}

/// (user, category) pair a badge is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    pub user_id: i64,
    pub category_id: i64,
}

impl SubjectKey {
    pub fn new(user_id: i64, category_id: i64) -> Self {
        Self {
            user_id,
            category_id,
        }
    }

    pub fn chunk_key(&self) -> ChunkKey {
        ChunkKey::new(self.user_id, self.category_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeState {
    Active,
    Inactive,
}

impl BadgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for BadgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership tier, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bronze" => Some(Self::Bronze),
            "silver" => Some(Self::Silver),
            "gold" => Some(Self::Gold),
            "platinum" => Some(Self::Platinum),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computed badge state, written to the badge snapshot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadgeComputation {
    pub key: SubjectKey,
    pub new_state: BadgeState,
}

/// Computed tier, written to the level snapshot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelComputation {
    pub user_id: i64,
    pub new_tier: Tier,
}

/// Coupon a member is entitled to for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: i64,
    pub coupon_code: String,
}

/// Business thresholds for badge, tier and coupon decisions.
///
/// Implementations must be pure: the same inputs always produce the same
/// output, so a resumed run computes what the interrupted attempt would have.
pub trait BatchRules: Send + Sync {
    fn badge_state(&self, key: SubjectKey, qualified: bool) -> BadgeState;

    fn tier_for(&self, user_id: i64, active_badges: usize) -> Tier;

    fn entitlement_for(&self, user_id: i64, tier: Tier) -> Option<Entitlement>;
}

/// Default rules: a badge is active iff the period qualified, the tier
/// follows the number of active badges.
#[derive(Debug, Clone)]
pub struct ThresholdRules {
    pub silver_badges: usize,
    pub gold_badges: usize,
    pub platinum_badges: usize,
}

impl Default for ThresholdRules {
    fn default() -> Self {
        Self {
            silver_badges: 1,
            gold_badges: 3,
            platinum_badges: 5,
        }
    }
}

impl BatchRules for ThresholdRules {
    fn badge_state(&self, _key: SubjectKey, qualified: bool) -> BadgeState {
        if qualified {
            BadgeState::Active
        } else {
            BadgeState::Inactive
        }
    }

    fn tier_for(&self, _user_id: i64, active_badges: usize) -> Tier {
        if active_badges >= self.platinum_badges {
            Tier::Platinum
        } else if active_badges >= self.gold_badges {
            Tier::Gold
        } else if active_badges >= self.silver_badges {
            Tier::Silver
        } else {
            Tier::Bronze
        }
    }

    fn entitlement_for(&self, user_id: i64, tier: Tier) -> Option<Entitlement> {
        let coupon_code = match tier {
            Tier::Bronze => return None,
            Tier::Silver => "SILVER-MONTHLY",
            Tier::Gold => "GOLD-MONTHLY",
            Tier::Platinum => "PLATINUM-MONTHLY",
        };
        Some(Entitlement {
            user_id,
            coupon_code: coupon_code.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_rules_map_badge_counts_to_tiers() {
        let rules = ThresholdRules::default();
        assert_eq!(rules.tier_for(1, 0), Tier::Bronze);
        assert_eq!(rules.tier_for(1, 1), Tier::Silver);
        assert_eq!(rules.tier_for(1, 4), Tier::Gold);
        assert_eq!(rules.tier_for(1, 9), Tier::Platinum);
    }

    #[test]
    fn bronze_members_get_no_coupon() {
        let rules = ThresholdRules::default();
        assert!(rules.entitlement_for(7, Tier::Bronze).is_none());
        let coupon = rules.entitlement_for(7, Tier::Gold).expect("gold coupon");
        assert_eq!(coupon.coupon_code, "GOLD-MONTHLY");
    }

    #[test]
    fn badge_keys_are_sorted_and_deduplicated() {
        let subject = Subject::new(4, vec![9, 2, 9, 5]);
        let keys: Vec<_> = subject.badge_keys().map(|key| key.category_id).collect();
        assert_eq!(keys, vec![2, 5, 9]);
    }
}
