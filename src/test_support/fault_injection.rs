//! Backend wrapper that injects failures and scale-out signals into an
//! otherwise healthy `MemoryBackend`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::backends::{
    BackendError, BackendResult, ChunkLedgerBackend, EntitlementBackend, ExecutionLogBackend,
    MembershipBackend, MemoryBackend, SnapshotBackend, SubjectSource,
};
use crate::cluster::CoordinationFlags;
use crate::domain::{BadgeComputation, Entitlement, LevelComputation, Subject, SubjectKey, Tier};
use crate::models::{
    ApplyOutcome, BadgeResult, BatchExecution, ChunkRange, ChunkRecord, ClusterMember,
    ExecutionClaim, ExecutionId, InterruptCause, LevelResult, MemberId, MemberRegistration,
    SnapshotCounts, StepType, UserRange,
};

/// Badge write failure for chunks containing `user_id`, held back until
/// `after_completed` badge chunks are in the ledger.
#[derive(Clone, Copy)]
struct BadgeWriteFault {
    user_id: i64,
    after_completed: usize,
}

#[derive(Clone)]
pub struct FaultInjectingBackend {
    inner: MemoryBackend,
    badge_write_fault: Arc<Mutex<Option<BadgeWriteFault>>>,
    latch_on_badge_write: Arc<Mutex<Option<(i64, Arc<CoordinationFlags>)>>>,
    handover_on_badge_write: Arc<Mutex<Option<(i64, MemberId)>>>,
    fail_next_badge_apply: Arc<AtomicBool>,
    fail_next_level_apply: Arc<AtomicBool>,
    fail_next_get_execution: Arc<AtomicBool>,
    mark_interrupted_failures: Arc<AtomicUsize>,
    badge_write_calls: Arc<AtomicUsize>,
}

impl FaultInjectingBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            badge_write_fault: Arc::new(Mutex::new(None)),
            latch_on_badge_write: Arc::new(Mutex::new(None)),
            handover_on_badge_write: Arc::new(Mutex::new(None)),
            fail_next_badge_apply: Arc::new(AtomicBool::new(false)),
            fail_next_level_apply: Arc::new(AtomicBool::new(false)),
            fail_next_get_execution: Arc::new(AtomicBool::new(false)),
            mark_interrupted_failures: Arc::new(AtomicUsize::new(0)),
            badge_write_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    pub fn fail_badge_writes_for(&self, user_id: i64, after_completed: usize) {
        *self.badge_write_fault.lock().expect("fault poisoned") = Some(BadgeWriteFault {
            user_id,
            after_completed,
        });
    }

    /// Raise `flags`' scale-out latch once a badge chunk containing `user_id`
    /// has been written.
    pub fn raise_latch_after_badge_write(&self, user_id: i64, flags: Arc<CoordinationFlags>) {
        *self.latch_on_badge_write.lock().expect("latch poisoned") = Some((user_id, flags));
    }

    /// Once a badge chunk containing `user_id` has been written, interrupt
    /// the run as owner-lost and hand it to `new_owner` as a restore.
    pub fn hand_over_after_badge_write(&self, user_id: i64, new_owner: MemberId) {
        *self.handover_on_badge_write.lock().expect("handover poisoned") =
            Some((user_id, new_owner));
    }

    pub fn fail_next_badge_apply(&self) {
        self.fail_next_badge_apply.store(true, AtomicOrdering::SeqCst);
    }

    pub fn fail_next_level_apply(&self) {
        self.fail_next_level_apply.store(true, AtomicOrdering::SeqCst);
    }

    pub fn fail_next_get_execution(&self) {
        self.fail_next_get_execution.store(true, AtomicOrdering::SeqCst);
    }

    /// Fail the next `times` calls to `mark_interrupted`.
    pub fn fail_mark_interrupted(&self, times: usize) {
        self.mark_interrupted_failures
            .store(times, AtomicOrdering::SeqCst);
    }

    pub fn clear_faults(&self) {
        *self.badge_write_fault.lock().expect("fault poisoned") = None;
        *self.latch_on_badge_write.lock().expect("latch poisoned") = None;
        *self.handover_on_badge_write.lock().expect("handover poisoned") = None;
        self.fail_next_badge_apply.store(false, AtomicOrdering::SeqCst);
        self.fail_next_level_apply.store(false, AtomicOrdering::SeqCst);
        self.fail_next_get_execution.store(false, AtomicOrdering::SeqCst);
        self.mark_interrupted_failures.store(0, AtomicOrdering::SeqCst);
    }

    pub fn badge_write_calls(&self) -> usize {
        self.badge_write_calls.load(AtomicOrdering::SeqCst)
    }

    fn completed_badge_chunks(&self) -> usize {
        self.inner
            .chunk_records()
            .iter()
            .filter(|record| record.step == StepType::Badge && record.completed)
            .count()
    }
}

#[async_trait]
impl MembershipBackend for FaultInjectingBackend {
    async fn register_member(
        &self,
        registration: &MemberRegistration,
        now: DateTime<Utc>,
    ) -> BackendResult<ClusterMember> {
        self.inner.register_member(registration, now).await
    }

    async fn heartbeat_member(
        &self,
        member_id: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        self.inner.heartbeat_member(member_id, now).await
    }

    async fn list_alive_members(
        &self,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<Vec<ClusterMember>> {
        self.inner.list_alive_members(alive_since).await
    }
}

#[async_trait]
impl ExecutionLogBackend for FaultInjectingBackend {
    async fn claim_execution(
        &self,
        claim: &ExecutionClaim,
    ) -> BackendResult<Option<BatchExecution>> {
        self.inner.claim_execution(claim).await
    }

    async fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> BackendResult<Option<BatchExecution>> {
        if self.fail_next_get_execution.swap(false, AtomicOrdering::SeqCst) {
            return Err(BackendError::Message("injected execution read failure".to_string()));
        }
        self.inner.get_execution(execution_id).await
    }

    async fn list_executions(&self, target_date: NaiveDate) -> BackendResult<Vec<BatchExecution>> {
        self.inner.list_executions(target_date).await
    }

    async fn mark_completed(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        self.inner.mark_completed(execution_id, owner, now).await
    }

    async fn mark_interrupted(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        cause: InterruptCause,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let injected = self
            .mark_interrupted_failures
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(BackendError::Message("injected interrupt write failure".to_string()));
        }
        self.inner
            .mark_interrupted(execution_id, owner, cause, now)
            .await
    }

    async fn has_completed_execution(&self, target_date: NaiveDate) -> BackendResult<bool> {
        self.inner.has_completed_execution(target_date).await
    }

    async fn count_alive_active_owners(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<usize> {
        self.inner
            .count_alive_active_owners(target_date, alive_since)
            .await
    }

    async fn interrupt_orphaned_executions(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BackendResult<usize> {
        self.inner
            .interrupt_orphaned_executions(target_date, alive_since, now)
            .await
    }

    async fn list_restorable_executions(
        &self,
        target_date: NaiveDate,
    ) -> BackendResult<Vec<BatchExecution>> {
        self.inner.list_restorable_executions(target_date).await
    }

    async fn acquire_restore(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        self.inner.acquire_restore(execution_id, owner, now).await
    }
}

#[async_trait]
impl ChunkLedgerBackend for FaultInjectingBackend {
    async fn record_chunk(&self, record: &ChunkRecord) -> BackendResult<()> {
        self.inner.record_chunk(record).await
    }

    async fn completed_ranges(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRange>> {
        self.inner.completed_ranges(execution_id, step).await
    }

    async fn list_chunks(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRecord>> {
        self.inner.list_chunks(execution_id, step).await
    }
}

#[async_trait]
impl SnapshotBackend for FaultInjectingBackend {
    async fn materialize_subjects(
        &self,
        execution_id: ExecutionId,
        subjects: &[Subject],
    ) -> BackendResult<()> {
        self.inner.materialize_subjects(execution_id, subjects).await
    }

    async fn materialized_subjects(
        &self,
        execution_id: ExecutionId,
    ) -> BackendResult<Option<Vec<Subject>>> {
        self.inner.materialized_subjects(execution_id).await
    }

    async fn write_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeComputation],
    ) -> BackendResult<usize> {
        self.badge_write_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let fault = *self.badge_write_fault.lock().expect("fault poisoned");
        if let Some(fault) = fault
            && results.iter().any(|result| result.key.user_id == fault.user_id)
        {
            while self.completed_badge_chunks() < fault.after_completed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            return Err(BackendError::Message(format!(
                "injected badge write failure for user {}",
                fault.user_id
            )));
        }

        let written = self.inner.write_badge_results(execution_id, results).await?;

        let latch = self.latch_on_badge_write.lock().expect("latch poisoned").clone();
        if let Some((user_id, flags)) = latch
            && results.iter().any(|result| result.key.user_id == user_id)
        {
            flags.raise_scale_out();
        }

        let handover = self
            .handover_on_badge_write
            .lock()
            .expect("handover poisoned")
            .take_if(|(user_id, _)| results.iter().any(|result| result.key.user_id == *user_id));
        if let Some((_, new_owner)) = handover
            && let Some(execution) = self.inner.get_execution(execution_id).await?
            && let Some(owner) = execution.owner_member_id
        {
            let now = Utc::now();
            self.inner
                .mark_interrupted(execution_id, owner, InterruptCause::OwnerLost, now)
                .await?;
            self.inner.acquire_restore(execution_id, new_owner, now).await?;
        }
        Ok(written)
    }

    async fn write_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelComputation],
    ) -> BackendResult<usize> {
        self.inner.write_level_results(execution_id, results).await
    }

    async fn pending_badge_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<BadgeResult>> {
        self.inner
            .pending_badge_results(execution_id, users, limit)
            .await
    }

    async fn pending_level_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<LevelResult>> {
        self.inner
            .pending_level_results(execution_id, users, limit)
            .await
    }

    async fn apply_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome> {
        if self.fail_next_badge_apply.swap(false, AtomicOrdering::SeqCst) {
            return Err(BackendError::Message(
                "injected badge apply failure".to_string(),
            ));
        }
        self.inner
            .apply_badge_results(execution_id, results, now)
            .await
    }

    async fn apply_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome> {
        if self.fail_next_level_apply.swap(false, AtomicOrdering::SeqCst) {
            return Err(BackendError::Message(
                "injected level apply failure".to_string(),
            ));
        }
        self.inner
            .apply_level_results(execution_id, results, now)
            .await
    }

    async fn snapshot_counts(&self, execution_id: ExecutionId) -> BackendResult<SnapshotCounts> {
        self.inner.snapshot_counts(execution_id).await
    }
}

#[async_trait]
impl SubjectSource for FaultInjectingBackend {
    async fn read_all_subjects(&self) -> BackendResult<Vec<Subject>> {
        self.inner.read_all_subjects().await
    }

    async fn read_period_statistics(
        &self,
        target_date: NaiveDate,
        cutoff: DateTime<Utc>,
    ) -> BackendResult<HashMap<SubjectKey, bool>> {
        self.inner.read_period_statistics(target_date, cutoff).await
    }

    async fn count_active_badges(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, usize>> {
        self.inner.count_active_badges(user_ids).await
    }

    async fn load_tiers(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, Tier>> {
        self.inner.load_tiers(user_ids).await
    }
}

#[async_trait]
impl EntitlementBackend for FaultInjectingBackend {
    async fn issue_entitlements(
        &self,
        execution_id: ExecutionId,
        entitlements: &[Entitlement],
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> BackendResult<usize> {
        self.inner
            .issue_entitlements(execution_id, entitlements, batch_size, now)
            .await
    }
}
