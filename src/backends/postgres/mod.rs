//! Postgres backend for the execution log, chunk ledger, snapshot tables and
//! cluster membership.

mod cluster;
mod execution;
mod snapshot;
mod source;

use sqlx::PgPool;

use crate::db;
use crate::observability::obs;

use super::base::{BackendError, BackendResult};

/// Rows per multi-row INSERT. Keeps every statement under the bind limit.
const INSERT_BATCH_ROWS: usize = 5_000;

/// Persist batch state in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[obs]
    pub async fn connect(dsn: &str) -> BackendResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every batch and membership-domain row. Intended for tests.
    #[obs]
    pub async fn clear_all(&self) -> BackendResult<()> {
        sqlx::query(
            r#"
            TRUNCATE chunk_executions,
                     execution_subjects,
                     badge_results,
                     level_results,
                     batch_executions,
                     cluster_members,
                     users,
                     user_badges,
                     user_period_stats,
                     badge_change_logs,
                     tier_change_logs,
                     user_coupons
            RESTART IDENTITY
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Decode a text column through one of the model `parse` functions.
pub(super) fn parse_column<T>(
    value: &str,
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> BackendResult<T> {
    parse(value).ok_or_else(|| BackendError::Message(format!("invalid {column}: {value}")))
}

/// True for a unique-constraint violation (SQLSTATE 23505).
pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err
        && let Some(code) = db_err.code()
    {
        return code.as_ref() == "23505";
    }
    false
}
