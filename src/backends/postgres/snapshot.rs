use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use super::{INSERT_BATCH_ROWS, PostgresBackend, parse_column};
use crate::backends::base::{BackendResult, EntitlementBackend, SnapshotBackend};
use crate::domain::{BadgeComputation, BadgeState, Entitlement, LevelComputation, Subject, Tier};
use crate::models::{
    ApplyOutcome, BadgeResult, ExecutionId, LevelResult, SnapshotCounts, SnapshotStatus,
    StatusCounts, UserRange,
};
use crate::observability::obs;

fn badge_result_from_row(row: &PgRow) -> BackendResult<BadgeResult> {
    let execution_id: Uuid = row.get("execution_id");
    let new_state: String = row.get("new_state");
    let status: String = row.get("status");
    Ok(BadgeResult {
        execution_id: ExecutionId(execution_id),
        user_id: row.get("user_id"),
        category_id: row.get("category_id"),
        new_state: parse_column(&new_state, "badge state", BadgeState::parse)?,
        status: parse_column(&status, "snapshot status", SnapshotStatus::parse)?,
        applied_at: row.get("applied_at"),
    })
}

fn level_result_from_row(row: &PgRow) -> BackendResult<LevelResult> {
    let execution_id: Uuid = row.get("execution_id");
    let new_tier: String = row.get("new_tier");
    let status: String = row.get("status");
    Ok(LevelResult {
        execution_id: ExecutionId(execution_id),
        user_id: row.get("user_id"),
        new_tier: parse_column(&new_tier, "tier", Tier::parse)?,
        status: parse_column(&status, "snapshot status", SnapshotStatus::parse)?,
        applied_at: row.get("applied_at"),
    })
}

fn status_counts(rows: &[PgRow]) -> BackendResult<StatusCounts> {
    let mut counts = StatusCounts::default();
    for row in rows {
        let status: String = row.get("status");
        let count: i64 = row.get("count");
        match parse_column(&status, "snapshot status", SnapshotStatus::parse)? {
            SnapshotStatus::Pending => counts.pending = count as usize,
            SnapshotStatus::Applied => counts.applied = count as usize,
            SnapshotStatus::Failed => counts.failed = count as usize,
        }
    }
    Ok(counts)
}

#[async_trait]
impl SnapshotBackend for PostgresBackend {
    #[obs]
    async fn materialize_subjects(
        &self,
        execution_id: ExecutionId,
        subjects: &[Subject],
    ) -> BackendResult<()> {
        if subjects.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        // Serializes concurrent first attempts of the same run.
        sqlx::query("SELECT execution_id FROM batch_executions WHERE execution_id = $1 FOR UPDATE")
            .bind(execution_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM execution_subjects WHERE execution_id = $1)",
        )
        .bind(execution_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if exists {
            tx.commit().await?;
            return Ok(());
        }

        for batch in subjects.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO execution_subjects (execution_id, user_id, category_ids) ",
            );
            builder.push_values(batch, |mut b, subject| {
                b.push_bind(execution_id.0)
                    .push_bind(subject.user_id)
                    .push_bind(&subject.category_ids);
            });
            builder.push(" ON CONFLICT (execution_id, user_id) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[obs]
    async fn materialized_subjects(
        &self,
        execution_id: ExecutionId,
    ) -> BackendResult<Option<Vec<Subject>>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, category_ids
            FROM execution_subjects
            WHERE execution_id = $1
            ORDER BY user_id
            "#,
        )
        .bind(execution_id.0)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.iter()
                .map(|row| Subject::new(row.get("user_id"), row.get("category_ids")))
                .collect(),
        ))
    }

    #[obs]
    async fn write_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeComputation],
    ) -> BackendResult<usize> {
        if results.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for batch in results.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO badge_results (execution_id, user_id, category_id, new_state) ",
            );
            builder.push_values(batch, |mut b, result| {
                b.push_bind(execution_id.0)
                    .push_bind(result.key.user_id)
                    .push_bind(result.key.category_id)
                    .push_bind(result.new_state.as_str());
            });
            builder.push(" ON CONFLICT (execution_id, user_id, category_id) DO NOTHING");
            written += builder.build().execute(&mut *tx).await?.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    #[obs]
    async fn write_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelComputation],
    ) -> BackendResult<usize> {
        if results.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for batch in results.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO level_results (execution_id, user_id, new_tier) ");
            builder.push_values(batch, |mut b, result| {
                b.push_bind(execution_id.0)
                    .push_bind(result.user_id)
                    .push_bind(result.new_tier.as_str());
            });
            builder.push(" ON CONFLICT (execution_id, user_id) DO NOTHING");
            written += builder.build().execute(&mut *tx).await?.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    #[obs]
    async fn pending_badge_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<BadgeResult>> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, user_id, category_id, new_state, status, applied_at
            FROM badge_results
            WHERE execution_id = $1
              AND status = 'pending'
              AND user_id BETWEEN $2 AND $3
            ORDER BY user_id, category_id
            LIMIT $4
            "#,
        )
        .bind(execution_id.0)
        .bind(users.first)
        .bind(users.last)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(badge_result_from_row).collect()
    }

    #[obs]
    async fn pending_level_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<LevelResult>> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, user_id, new_tier, status, applied_at
            FROM level_results
            WHERE execution_id = $1
              AND status = 'pending'
              AND user_id BETWEEN $2 AND $3
            ORDER BY user_id
            LIMIT $4
            "#,
        )
        .bind(execution_id.0)
        .bind(users.first)
        .bind(users.last)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(level_result_from_row).collect()
    }

    #[obs]
    async fn apply_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome> {
        if results.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let mut tx = self.pool.begin().await?;
        let outcome = apply_computed_badge_states(&mut tx, execution_id, results, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    #[obs]
    async fn apply_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome> {
        if results.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let mut tx = self.pool.begin().await?;
        let outcome = apply_computed_tiers(&mut tx, execution_id, results, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    #[obs]
    async fn snapshot_counts(&self, execution_id: ExecutionId) -> BackendResult<SnapshotCounts> {
        let badge_rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM badge_results
            WHERE execution_id = $1
            GROUP BY status
            "#,
        )
        .bind(execution_id.0)
        .fetch_all(&self.pool)
        .await?;
        let level_rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM level_results
            WHERE execution_id = $1
            GROUP BY status
            "#,
        )
        .bind(execution_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(SnapshotCounts {
            badges: status_counts(&badge_rows)?,
            levels: status_counts(&level_rows)?,
        })
    }
}

/// Apply one page of badge rows inside `tx`.
///
/// Only rows still pending are touched; they are locked first so two appliers
/// racing on the same page cannot both finalize a row.
async fn apply_computed_badge_states(
    tx: &mut Transaction<'_, Postgres>,
    execution_id: ExecutionId,
    results: &[BadgeResult],
    now: DateTime<Utc>,
) -> BackendResult<ApplyOutcome> {
    let user_ids: Vec<i64> = results.iter().map(|result| result.user_id).collect();
    let category_ids: Vec<i64> = results.iter().map(|result| result.category_id).collect();

    let pending = sqlx::query(
        r#"
        SELECT br.user_id, br.category_id, br.new_state
        FROM badge_results br
        JOIN UNNEST($2::BIGINT[], $3::BIGINT[]) AS v(user_id, category_id)
          ON v.user_id = br.user_id AND v.category_id = br.category_id
        WHERE br.execution_id = $1 AND br.status = 'pending'
        ORDER BY br.user_id, br.category_id
        FOR UPDATE OF br
        "#,
    )
    .bind(execution_id.0)
    .bind(&user_ids)
    .bind(&category_ids)
    .fetch_all(&mut **tx)
    .await?;
    if pending.is_empty() {
        return Ok(ApplyOutcome::default());
    }

    let pending_users: Vec<i64> = pending.iter().map(|row| row.get("user_id")).collect();
    let existing: HashSet<i64> = sqlx::query_scalar::<_, i64>(
        "SELECT user_id FROM users WHERE user_id = ANY($1) FOR SHARE",
    )
    .bind(&pending_users)
    .fetch_all(&mut **tx)
    .await?
    .into_iter()
    .collect();

    let mut apply_users = Vec::new();
    let mut apply_categories = Vec::new();
    let mut apply_states = Vec::new();
    let mut failed_users = Vec::new();
    let mut failed_categories = Vec::new();
    for row in &pending {
        let user_id: i64 = row.get("user_id");
        let category_id: i64 = row.get("category_id");
        if existing.contains(&user_id) {
            let new_state: String = row.get("new_state");
            apply_users.push(user_id);
            apply_categories.push(category_id);
            apply_states.push(new_state);
        } else {
            failed_users.push(user_id);
            failed_categories.push(category_id);
        }
    }

    if !apply_users.is_empty() {
        let previous: HashMap<(i64, i64), String> = sqlx::query(
            r#"
            SELECT ub.user_id, ub.category_id, ub.state
            FROM user_badges ub
            JOIN UNNEST($1::BIGINT[], $2::BIGINT[]) AS v(user_id, category_id)
              ON v.user_id = ub.user_id AND v.category_id = ub.category_id
            FOR UPDATE OF ub
            "#,
        )
        .bind(&apply_users)
        .bind(&apply_categories)
        .fetch_all(&mut **tx)
        .await?
        .iter()
        .map(|row| {
            (
                (row.get::<i64, _>("user_id"), row.get::<i64, _>("category_id")),
                row.get::<String, _>("state"),
            )
        })
        .collect();

        sqlx::query(
            r#"
            INSERT INTO user_badges (user_id, category_id, state, updated_at)
            SELECT v.user_id, v.category_id, v.state, $4
            FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::TEXT[]) AS v(user_id, category_id, state)
            ON CONFLICT (user_id, category_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&apply_users)
        .bind(&apply_categories)
        .bind(&apply_states)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        let mut log_users = Vec::new();
        let mut log_categories = Vec::new();
        let mut log_previous: Vec<Option<String>> = Vec::new();
        let mut log_states = Vec::new();
        for ((user_id, category_id), state) in apply_users
            .iter()
            .zip(apply_categories.iter())
            .zip(apply_states.iter())
        {
            let before = previous.get(&(*user_id, *category_id));
            if before == Some(state) {
                continue;
            }
            log_users.push(*user_id);
            log_categories.push(*category_id);
            log_previous.push(before.cloned());
            log_states.push(state.clone());
        }
        if !log_users.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO badge_change_logs
                    (execution_id, user_id, category_id, previous_state, new_state, changed_at)
                SELECT $1, v.user_id, v.category_id, v.previous_state, v.new_state, $6
                FROM UNNEST($2::BIGINT[], $3::BIGINT[], $4::TEXT[], $5::TEXT[])
                    AS v(user_id, category_id, previous_state, new_state)
                "#,
            )
            .bind(execution_id.0)
            .bind(&log_users)
            .bind(&log_categories)
            .bind(&log_previous)
            .bind(&log_states)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }

        finalize_badge_rows(tx, execution_id, &apply_users, &apply_categories, "applied", now)
            .await?;
    }
    if !failed_users.is_empty() {
        finalize_badge_rows(tx, execution_id, &failed_users, &failed_categories, "failed", now)
            .await?;
    }

    Ok(ApplyOutcome {
        applied: apply_users.len(),
        failed: failed_users.len(),
    })
}

async fn finalize_badge_rows(
    tx: &mut Transaction<'_, Postgres>,
    execution_id: ExecutionId,
    user_ids: &[i64],
    category_ids: &[i64],
    status: &str,
    now: DateTime<Utc>,
) -> BackendResult<()> {
    sqlx::query(
        r#"
        UPDATE badge_results br
        SET status = $4,
            applied_at = CASE WHEN $4 = 'applied' THEN $5 ELSE NULL END
        FROM UNNEST($2::BIGINT[], $3::BIGINT[]) AS v(user_id, category_id)
        WHERE br.execution_id = $1
          AND br.user_id = v.user_id
          AND br.category_id = v.category_id
          AND br.status = 'pending'
        "#,
    )
    .bind(execution_id.0)
    .bind(user_ids)
    .bind(category_ids)
    .bind(status)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Apply one page of tier rows inside `tx`. Users that no longer exist fail
/// their row instead of aborting the page.
async fn apply_computed_tiers(
    tx: &mut Transaction<'_, Postgres>,
    execution_id: ExecutionId,
    results: &[LevelResult],
    now: DateTime<Utc>,
) -> BackendResult<ApplyOutcome> {
    let user_ids: Vec<i64> = results.iter().map(|result| result.user_id).collect();

    let pending = sqlx::query(
        r#"
        SELECT user_id, new_tier
        FROM level_results
        WHERE execution_id = $1 AND status = 'pending' AND user_id = ANY($2)
        ORDER BY user_id
        FOR UPDATE
        "#,
    )
    .bind(execution_id.0)
    .bind(&user_ids)
    .fetch_all(&mut **tx)
    .await?;
    if pending.is_empty() {
        return Ok(ApplyOutcome::default());
    }

    let pending_users: Vec<i64> = pending.iter().map(|row| row.get("user_id")).collect();
    let previous: HashMap<i64, String> = sqlx::query(
        r#"
        SELECT user_id, tier
        FROM users
        WHERE user_id = ANY($1)
        ORDER BY user_id
        FOR UPDATE
        "#,
    )
    .bind(&pending_users)
    .fetch_all(&mut **tx)
    .await?
    .iter()
    .map(|row| (row.get::<i64, _>("user_id"), row.get::<String, _>("tier")))
    .collect();

    let mut apply_users = Vec::new();
    let mut apply_tiers = Vec::new();
    let mut failed_users = Vec::new();
    let mut log_users = Vec::new();
    let mut log_previous = Vec::new();
    let mut log_tiers = Vec::new();
    for row in &pending {
        let user_id: i64 = row.get("user_id");
        let new_tier: String = row.get("new_tier");
        let Some(before) = previous.get(&user_id) else {
            failed_users.push(user_id);
            continue;
        };
        if *before != new_tier {
            log_users.push(user_id);
            log_previous.push(before.clone());
            log_tiers.push(new_tier.clone());
        }
        apply_users.push(user_id);
        apply_tiers.push(new_tier);
    }

    if !apply_users.is_empty() {
        sqlx::query(
            r#"
            UPDATE users u
            SET tier = v.tier
            FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS v(user_id, tier)
            WHERE u.user_id = v.user_id
            "#,
        )
        .bind(&apply_users)
        .bind(&apply_tiers)
        .execute(&mut **tx)
        .await?;

        if !log_users.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO tier_change_logs
                    (execution_id, user_id, previous_tier, new_tier, changed_at)
                SELECT $1, v.user_id, v.previous_tier, v.new_tier, $5
                FROM UNNEST($2::BIGINT[], $3::TEXT[], $4::TEXT[])
                    AS v(user_id, previous_tier, new_tier)
                "#,
            )
            .bind(execution_id.0)
            .bind(&log_users)
            .bind(&log_previous)
            .bind(&log_tiers)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }

        finalize_level_rows(tx, execution_id, &apply_users, "applied", now).await?;
    }
    if !failed_users.is_empty() {
        finalize_level_rows(tx, execution_id, &failed_users, "failed", now).await?;
    }

    Ok(ApplyOutcome {
        applied: apply_users.len(),
        failed: failed_users.len(),
    })
}

async fn finalize_level_rows(
    tx: &mut Transaction<'_, Postgres>,
    execution_id: ExecutionId,
    user_ids: &[i64],
    status: &str,
    now: DateTime<Utc>,
) -> BackendResult<()> {
    sqlx::query(
        r#"
        UPDATE level_results
        SET status = $3,
            applied_at = CASE WHEN $3 = 'applied' THEN $4 ELSE NULL END
        WHERE execution_id = $1
          AND user_id = ANY($2)
          AND status = 'pending'
        "#,
    )
    .bind(execution_id.0)
    .bind(user_ids)
    .bind(status)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl EntitlementBackend for PostgresBackend {
    #[obs]
    async fn issue_entitlements(
        &self,
        execution_id: ExecutionId,
        entitlements: &[Entitlement],
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> BackendResult<usize> {
        if entitlements.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut issued = 0;
        for batch in entitlements.chunks(batch_size.clamp(1, INSERT_BATCH_ROWS)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO user_coupons (execution_id, user_id, coupon_code, issued_at) ",
            );
            builder.push_values(batch, |mut b, entitlement| {
                b.push_bind(execution_id.0)
                    .push_bind(entitlement.user_id)
                    .push_bind(&entitlement.coupon_code)
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT (execution_id, user_id) DO NOTHING");
            issued += builder.build().execute(&mut *tx).await?.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(issued)
    }
}
