//! Backend interfaces for the execution log, chunk ledger, snapshot tables,
//! cluster membership and the membership-domain data the batch reads and
//! mutates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::{BadgeComputation, Entitlement, LevelComputation, Subject, SubjectKey, Tier};
use crate::models::{
    ApplyOutcome, BadgeResult, BatchExecution, ChunkRange, ChunkRecord, ClusterMember,
    ExecutionClaim, ExecutionId, InterruptCause, LevelResult, MemberId, MemberRegistration,
    SnapshotCounts, StepType, UserRange,
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Heartbeat-based membership registry storage.
#[async_trait]
pub trait MembershipBackend: Send + Sync {
    /// Insert (or refresh) the row for a starting process.
    async fn register_member(
        &self,
        registration: &MemberRegistration,
        now: DateTime<Utc>,
    ) -> BackendResult<ClusterMember>;

    async fn heartbeat_member(&self, member_id: MemberId, now: DateTime<Utc>)
    -> BackendResult<()>;

    /// Members whose last heartbeat is newer than `alive_since`, ordered by
    /// process index.
    async fn list_alive_members(
        &self,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<Vec<ClusterMember>>;
}

/// Execution log storage and the run-level claim.
///
/// Implementations must make ownership transitions atomic:
/// - `claim_execution` inserts a running row only if no running/restoring row
///   exists for the target date, returning `None` on conflict.
/// - `acquire_restore` moves a row from interrupted to restoring only if it is
///   still interrupted and no other run holds the date.
/// - `mark_completed` / `mark_interrupted` only touch active rows still owned
///   by `owner`, so a member that lost its run cannot finalize it.
#[async_trait]
pub trait ExecutionLogBackend: Send + Sync {
    async fn claim_execution(&self, claim: &ExecutionClaim)
    -> BackendResult<Option<BatchExecution>>;

    async fn get_execution(&self, execution_id: ExecutionId)
    -> BackendResult<Option<BatchExecution>>;

    async fn list_executions(&self, target_date: NaiveDate) -> BackendResult<Vec<BatchExecution>>;

    async fn mark_completed(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool>;

    async fn mark_interrupted(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        cause: InterruptCause,
        now: DateTime<Utc>,
    ) -> BackendResult<bool>;

    async fn has_completed_execution(&self, target_date: NaiveDate) -> BackendResult<bool>;

    /// Distinct alive members owning an active run for the date.
    async fn count_alive_active_owners(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<usize>;

    /// Move active runs whose owner stopped heartbeating to interrupted.
    async fn interrupt_orphaned_executions(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BackendResult<usize>;

    /// Interrupted runs for the date, oldest first. Dates that already have a
    /// completed run yield nothing.
    async fn list_restorable_executions(
        &self,
        target_date: NaiveDate,
    ) -> BackendResult<Vec<BatchExecution>>;

    async fn acquire_restore(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool>;
}

/// Chunk completion ledger.
#[async_trait]
pub trait ChunkLedgerBackend: Send + Sync {
    /// Upsert a ledger row. A range already recorded as completed is never
    /// downgraded.
    async fn record_chunk(&self, record: &ChunkRecord) -> BackendResult<()>;

    async fn completed_ranges(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRange>>;

    async fn list_chunks(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRecord>>;
}

/// Execution-scoped staging tables and the apply transaction.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Record the input subject set of a run. A second call for the same run
    /// leaves the first set untouched.
    async fn materialize_subjects(
        &self,
        execution_id: ExecutionId,
        subjects: &[Subject],
    ) -> BackendResult<()>;

    async fn materialized_subjects(
        &self,
        execution_id: ExecutionId,
    ) -> BackendResult<Option<Vec<Subject>>>;

    /// Write pending badge rows in one transaction; existing rows are kept.
    async fn write_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeComputation],
    ) -> BackendResult<usize>;

    async fn write_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelComputation],
    ) -> BackendResult<usize>;

    /// Pending badge rows of the run within `users`, ordered by key.
    async fn pending_badge_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<BadgeResult>>;

    async fn pending_level_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<LevelResult>>;

    /// In one transaction: update live badges, log the changes and finalize
    /// the given pending rows.
    async fn apply_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome>;

    async fn apply_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome>;

    async fn snapshot_counts(&self, execution_id: ExecutionId) -> BackendResult<SnapshotCounts>;
}

/// Read side of the membership domain.
#[async_trait]
pub trait SubjectSource: Send + Sync {
    async fn read_all_subjects(&self) -> BackendResult<Vec<Subject>>;

    /// Qualification per (user, category) for the business day, as recorded
    /// up to `cutoff`.
    async fn read_period_statistics(
        &self,
        target_date: NaiveDate,
        cutoff: DateTime<Utc>,
    ) -> BackendResult<HashMap<SubjectKey, bool>>;

    async fn count_active_badges(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, usize>>;

    async fn load_tiers(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, Tier>>;
}

/// Coupon issuance.
#[async_trait]
pub trait EntitlementBackend: Send + Sync {
    /// Issue coupons for one run in a single transaction, inserting
    /// `batch_size` rows per statement. Re-issuing for the same (run, user) is
    /// a no-op.
    async fn issue_entitlements(
        &self,
        execution_id: ExecutionId,
        entitlements: &[Entitlement],
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> BackendResult<usize>;
}

/// Everything the orchestrator and its background tasks need from storage.
pub trait BatchBackend:
    MembershipBackend
    + ExecutionLogBackend
    + ChunkLedgerBackend
    + SnapshotBackend
    + SubjectSource
    + EntitlementBackend
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> BatchBackend for T where
    T: MembershipBackend
        + ExecutionLogBackend
        + ChunkLedgerBackend
        + SnapshotBackend
        + SubjectSource
        + EntitlementBackend
        + Clone
        + Send
        + Sync
        + 'static
{
}
