//! Seed data shared by orchestrator, restore and scheduler tests.

use chrono::{Duration, NaiveDate, Utc};

use crate::backends::MemoryBackend;
use crate::domain::{BadgeState, Tier};

pub fn target_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date")
}

/// Users `1..=count`, each tracked in categories 10, 20 and 30. User `n`
/// qualifies in `n % 4` of them, so tiers spread across bronze..gold.
pub fn seed_members(backend: &MemoryBackend, count: i64) {
    let recorded_at = Utc::now() - Duration::minutes(5);
    for user_id in 1..=count {
        backend.insert_user(user_id, vec![10, 20, 30], Tier::Bronze);
        let qualified = (user_id % 4) as usize;
        for (index, category_id) in [10, 20, 30].into_iter().enumerate() {
            backend.record_period_stat(
                user_id,
                category_id,
                target_date(),
                index < qualified,
                recorded_at,
            );
        }
    }
}

/// Give user 1 a badge that the next run must deactivate.
pub fn seed_stale_badge(backend: &MemoryBackend) {
    backend.set_user_badge(1, 30, BadgeState::Active);
}
