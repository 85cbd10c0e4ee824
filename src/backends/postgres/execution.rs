use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use super::{PostgresBackend, is_unique_violation, parse_column};
use crate::backends::base::{BackendResult, ChunkLedgerBackend, ExecutionLogBackend};
use crate::models::{
    BatchExecution, BatchStatus, ChunkKey, ChunkRange, ChunkRecord, ExecutionClaim, ExecutionId,
    InterruptCause, MemberId, StepType,
};
use crate::observability::obs;

const EXECUTION_COLUMNS: &str = "execution_id, target_date, cutoff_at, status, interrupted, \
     interrupt_cause, interrupted_at, restored_at, started_at, ended_at, owner_member_id";

fn execution_from_row(row: &PgRow) -> BackendResult<BatchExecution> {
    let execution_id: Uuid = row.get("execution_id");
    let status: String = row.get("status");
    let interrupt_cause: Option<String> = row.get("interrupt_cause");
    let owner: Option<Uuid> = row.get("owner_member_id");
    Ok(BatchExecution {
        execution_id: ExecutionId(execution_id),
        target_date: row.get("target_date"),
        cutoff_at: row.get("cutoff_at"),
        status: parse_column(&status, "batch status", BatchStatus::parse)?,
        interrupted: row.get("interrupted"),
        interrupt_cause: interrupt_cause
            .as_deref()
            .map(|cause| parse_column(cause, "interrupt cause", InterruptCause::parse))
            .transpose()?,
        interrupted_at: row.get("interrupted_at"),
        restored_at: row.get("restored_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        owner_member_id: owner.map(MemberId),
    })
}

fn range_from_row(row: &PgRow) -> ChunkRange {
    ChunkRange::new(
        ChunkKey::new(row.get("start_primary"), row.get("start_secondary")),
        ChunkKey::new(row.get("end_primary"), row.get("end_secondary")),
    )
}

#[async_trait]
impl ExecutionLogBackend for PostgresBackend {
    #[obs]
    async fn claim_execution(
        &self,
        claim: &ExecutionClaim,
    ) -> BackendResult<Option<BatchExecution>> {
        // The partial unique index on active rows arbitrates concurrent claims.
        let sql = format!(
            r#"
            INSERT INTO batch_executions
                (execution_id, target_date, cutoff_at, status, started_at, owner_member_id)
            VALUES ($1, $2, $3, 'running', $4, $5)
            ON CONFLICT (target_date) WHERE status IN ('running', 'restoring')
            DO NOTHING
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(claim.execution_id.0)
            .bind(claim.target_date)
            .bind(claim.cutoff_at)
            .bind(claim.started_at)
            .bind(claim.owner.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[obs]
    async fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> BackendResult<Option<BatchExecution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM batch_executions WHERE execution_id = $1");
        let row = sqlx::query(&sql)
            .bind(execution_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[obs]
    async fn list_executions(&self, target_date: NaiveDate) -> BackendResult<Vec<BatchExecution>> {
        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM batch_executions
            WHERE target_date = $1
            ORDER BY started_at, execution_id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(target_date)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(execution_from_row).collect()
    }

    #[obs]
    async fn mark_completed(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_executions
            SET status = 'completed', ended_at = $3
            WHERE execution_id = $1
              AND owner_member_id = $2
              AND status IN ('running', 'restoring')
            "#,
        )
        .bind(execution_id.0)
        .bind(owner.0)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[obs]
    async fn mark_interrupted(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        cause: InterruptCause,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_executions
            SET status = 'interrupted',
                interrupted = TRUE,
                interrupt_cause = $3,
                interrupted_at = $4,
                ended_at = $4
            WHERE execution_id = $1
              AND owner_member_id = $2
              AND status IN ('running', 'restoring')
            "#,
        )
        .bind(execution_id.0)
        .bind(owner.0)
        .bind(cause.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[obs]
    async fn has_completed_execution(&self, target_date: NaiveDate) -> BackendResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM batch_executions
                WHERE target_date = $1 AND status = 'completed'
            )
            "#,
        )
        .bind(target_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    #[obs]
    async fn count_alive_active_owners(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<usize> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT be.owner_member_id)
            FROM batch_executions be
            JOIN cluster_members cm ON cm.member_id = be.owner_member_id
            WHERE be.target_date = $1
              AND be.status IN ('running', 'restoring')
              AND cm.last_heartbeat_at > $2
            "#,
        )
        .bind(target_date)
        .bind(alive_since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as usize)
    }

    #[obs]
    async fn interrupt_orphaned_executions(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BackendResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE batch_executions be
            SET status = 'interrupted',
                interrupted = TRUE,
                interrupt_cause = 'owner_lost',
                interrupted_at = $3,
                ended_at = $3
            WHERE be.target_date = $1
              AND be.status IN ('running', 'restoring')
              AND NOT EXISTS (
                  SELECT 1 FROM cluster_members cm
                  WHERE cm.member_id = be.owner_member_id
                    AND cm.last_heartbeat_at > $2
              )
            "#,
        )
        .bind(target_date)
        .bind(alive_since)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    #[obs]
    async fn list_restorable_executions(
        &self,
        target_date: NaiveDate,
    ) -> BackendResult<Vec<BatchExecution>> {
        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM batch_executions
            WHERE target_date = $1
              AND status = 'interrupted'
              AND NOT EXISTS (
                  SELECT 1 FROM batch_executions done
                  WHERE done.target_date = $1 AND done.status = 'completed'
              )
            ORDER BY started_at, execution_id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(target_date)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(execution_from_row).collect()
    }

    #[obs]
    async fn acquire_restore(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_executions
            SET status = 'restoring',
                restored_at = $3,
                ended_at = NULL,
                owner_member_id = $2
            WHERE execution_id = $1
              AND status = 'interrupted'
            "#,
        )
        .bind(execution_id.0)
        .bind(owner.0)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            // Another run already holds the date.
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ChunkLedgerBackend for PostgresBackend {
    #[obs]
    async fn record_chunk(&self, record: &ChunkRecord) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_executions
                (execution_id, step, worker_id, recorded_at,
                 start_primary, start_secondary, end_primary, end_secondary,
                 completed, restored)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (execution_id, step, start_primary, start_secondary, end_primary, end_secondary)
            DO UPDATE SET
                worker_id = EXCLUDED.worker_id,
                recorded_at = EXCLUDED.recorded_at,
                completed = EXCLUDED.completed,
                restored = EXCLUDED.restored
            WHERE NOT chunk_executions.completed
            "#,
        )
        .bind(record.execution_id.0)
        .bind(record.step.as_str())
        .bind(&record.worker_id)
        .bind(record.recorded_at)
        .bind(record.range.start.primary)
        .bind(record.range.start.secondary)
        .bind(record.range.end.primary)
        .bind(record.range.end.secondary)
        .bind(record.completed)
        .bind(record.restored)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[obs]
    async fn completed_ranges(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRange>> {
        let rows = sqlx::query(
            r#"
            SELECT start_primary, start_secondary, end_primary, end_secondary
            FROM chunk_executions
            WHERE execution_id = $1 AND step = $2 AND completed
            "#,
        )
        .bind(execution_id.0)
        .bind(step.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(range_from_row).collect())
    }

    #[obs]
    async fn list_chunks(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, recorded_at, start_primary, start_secondary,
                   end_primary, end_secondary, completed, restored
            FROM chunk_executions
            WHERE execution_id = $1 AND step = $2
            ORDER BY start_primary, start_secondary
            "#,
        )
        .bind(execution_id.0)
        .bind(step.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChunkRecord {
                execution_id,
                step,
                worker_id: row.get("worker_id"),
                recorded_at: row.get("recorded_at"),
                range: range_from_row(row),
                completed: row.get("completed"),
                restored: row.get("restored"),
            })
            .collect())
    }
}
