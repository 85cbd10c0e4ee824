use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use super::PostgresBackend;
use crate::backends::base::{BackendError, BackendResult, MembershipBackend};
use crate::models::{ClusterMember, MemberId, MemberRegistration};
use crate::observability::obs;

fn member_from_row(row: &PgRow) -> ClusterMember {
    let member_id: Uuid = row.get("member_id");
    ClusterMember {
        member_id: MemberId(member_id),
        registered_at: row.get("registered_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        process_index: row.get("process_index"),
        address: row.get("address"),
    }
}

#[async_trait]
impl MembershipBackend for PostgresBackend {
    #[obs]
    async fn register_member(
        &self,
        registration: &MemberRegistration,
        now: DateTime<Utc>,
    ) -> BackendResult<ClusterMember> {
        let row = sqlx::query(
            r#"
            INSERT INTO cluster_members
                (member_id, process_index, address, registered_at, last_heartbeat_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (member_id)
            DO UPDATE SET
                process_index = EXCLUDED.process_index,
                address = EXCLUDED.address,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            RETURNING member_id, process_index, address, registered_at, last_heartbeat_at
            "#,
        )
        .bind(registration.member_id.0)
        .bind(registration.process_index)
        .bind(&registration.address)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(member_from_row(&row))
    }

    #[obs]
    async fn heartbeat_member(
        &self,
        member_id: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_members
            SET last_heartbeat_at = $2
            WHERE member_id = $1
            "#,
        )
        .bind(member_id.0)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::Message(format!(
                "member {member_id} not registered"
            )));
        }
        Ok(())
    }

    #[obs]
    async fn list_alive_members(
        &self,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<Vec<ClusterMember>> {
        let rows = sqlx::query(
            r#"
            SELECT member_id, process_index, address, registered_at, last_heartbeat_at
            FROM cluster_members
            WHERE last_heartbeat_at > $1
            ORDER BY process_index, member_id
            "#,
        )
        .bind(alive_since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(member_from_row).collect())
    }
}
