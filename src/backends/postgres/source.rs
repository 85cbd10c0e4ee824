use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;

use super::{PostgresBackend, parse_column};
use crate::backends::base::{BackendResult, SubjectSource};
use crate::domain::{Subject, SubjectKey, Tier};
use crate::observability::obs;

impl PostgresBackend {
    /// Insert or replace a member of the membership domain.
    #[obs]
    pub async fn upsert_user(
        &self,
        user_id: i64,
        category_ids: &[i64],
        tier: Tier,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, tier, category_ids)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id)
            DO UPDATE SET tier = EXCLUDED.tier, category_ids = EXCLUDED.category_ids
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(category_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[obs]
    pub async fn record_period_stat(
        &self,
        key: SubjectKey,
        target_date: NaiveDate,
        qualified: bool,
        recorded_at: DateTime<Utc>,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_period_stats (user_id, category_id, target_date, qualified, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, category_id, target_date)
            DO UPDATE SET qualified = EXCLUDED.qualified, recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(key.user_id)
        .bind(key.category_id)
        .bind(target_date)
        .bind(qualified)
        .bind(recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubjectSource for PostgresBackend {
    #[obs]
    async fn read_all_subjects(&self) -> BackendResult<Vec<Subject>> {
        let rows = sqlx::query("SELECT user_id, category_ids FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| Subject::new(row.get("user_id"), row.get("category_ids")))
            .collect())
    }

    #[obs]
    async fn read_period_statistics(
        &self,
        target_date: NaiveDate,
        cutoff: DateTime<Utc>,
    ) -> BackendResult<HashMap<SubjectKey, bool>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, category_id, qualified
            FROM user_period_stats
            WHERE target_date = $1 AND recorded_at <= $2
            "#,
        )
        .bind(target_date)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    SubjectKey::new(row.get("user_id"), row.get("category_id")),
                    row.get("qualified"),
                )
            })
            .collect())
    }

    #[obs]
    async fn count_active_badges(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, usize>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT user_id, COUNT(*) AS active
            FROM user_badges
            WHERE user_id = ANY($1) AND state = 'active'
            GROUP BY user_id
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let active: i64 = row.get("active");
                (row.get::<i64, _>("user_id"), active as usize)
            })
            .collect())
    }

    #[obs]
    async fn load_tiers(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, Tier>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT user_id, tier FROM users WHERE user_id = ANY($1)")
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut tiers = HashMap::with_capacity(rows.len());
        for row in rows {
            let tier: String = row.get("tier");
            tiers.insert(row.get("user_id"), parse_column(&tier, "tier", Tier::parse)?);
        }
        Ok(tiers)
    }
}
