//! Schema migrations for the batch tables.

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use tracing::info;

use crate::backends::BackendResult;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Bring the batch schema up to date. Members starting together serialize on
/// the migration lock.
pub async fn run_migrations(pool: &PgPool) -> BackendResult<()> {
    MIGRATOR.run(pool).await.map_err(sqlx::Error::from)?;
    info!(migrations = MIGRATOR.iter().count(), "batch schema up to date");
    Ok(())
}
