//! In-memory backend for tests and local runs.
//!
//! Every method takes the locks it needs for its whole body, so each call
//! behaves like one transaction. Multi-collection methods lock in field
//! declaration order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::base::{
    BackendError, BackendResult, ChunkLedgerBackend, EntitlementBackend, ExecutionLogBackend,
    MembershipBackend, SnapshotBackend, SubjectSource,
};
use crate::domain::{
    BadgeComputation, BadgeState, Entitlement, LevelComputation, Subject, SubjectKey, Tier,
};
use crate::models::{
    ApplyOutcome, BadgeResult, BatchExecution, BatchStatus, ChunkRange, ChunkRecord,
    ClusterMember, ExecutionClaim, ExecutionId, InterruptCause, LevelResult, MemberId,
    MemberRegistration, SnapshotCounts, SnapshotStatus, StepType, UserRange,
};

type BadgeResultKey = (ExecutionId, i64, i64);
type LevelResultKey = (ExecutionId, i64);

#[derive(Clone, Debug)]
struct MemoryUser {
    tier: Tier,
    category_ids: Vec<i64>,
}

#[derive(Clone, Debug)]
struct PeriodStat {
    key: SubjectKey,
    target_date: NaiveDate,
    qualified: bool,
    recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BadgeChangeLog {
    pub execution_id: ExecutionId,
    pub user_id: i64,
    pub category_id: i64,
    pub previous_state: Option<BadgeState>,
    pub new_state: BadgeState,
    pub changed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TierChangeLog {
    pub execution_id: ExecutionId,
    pub user_id: i64,
    pub previous_tier: Tier,
    pub new_tier: Tier,
    pub changed_at: DateTime<Utc>,
}

/// Backend that keeps every table in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    members: Arc<Mutex<BTreeMap<MemberId, ClusterMember>>>,
    executions: Arc<Mutex<Vec<BatchExecution>>>,
    chunks: Arc<Mutex<Vec<ChunkRecord>>>,
    subjects: Arc<Mutex<HashMap<ExecutionId, Vec<Subject>>>>,
    users: Arc<Mutex<BTreeMap<i64, MemoryUser>>>,
    user_badges: Arc<Mutex<BTreeMap<(i64, i64), BadgeState>>>,
    badge_results: Arc<Mutex<BTreeMap<BadgeResultKey, BadgeResult>>>,
    level_results: Arc<Mutex<BTreeMap<LevelResultKey, LevelResult>>>,
    badge_logs: Arc<Mutex<Vec<BadgeChangeLog>>>,
    tier_logs: Arc<Mutex<Vec<TierChangeLog>>>,
    period_stats: Arc<Mutex<Vec<PeriodStat>>>,
    coupons: Arc<Mutex<BTreeMap<LevelResultKey, Entitlement>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user_id: i64, category_ids: Vec<i64>, tier: Tier) {
        self.users
            .lock()
            .expect("users poisoned")
            .insert(user_id, MemoryUser { tier, category_ids });
    }

    pub fn remove_user(&self, user_id: i64) {
        self.users.lock().expect("users poisoned").remove(&user_id);
    }

    pub fn set_user_badge(&self, user_id: i64, category_id: i64, state: BadgeState) {
        self.user_badges
            .lock()
            .expect("user badges poisoned")
            .insert((user_id, category_id), state);
    }

    /// Record one qualification fact; a later call for the same key and date
    /// replaces the earlier one.
    pub fn record_period_stat(
        &self,
        user_id: i64,
        category_id: i64,
        target_date: NaiveDate,
        qualified: bool,
        recorded_at: DateTime<Utc>,
    ) {
        let key = SubjectKey::new(user_id, category_id);
        let mut stats = self.period_stats.lock().expect("period stats poisoned");
        stats.retain(|stat| !(stat.key == key && stat.target_date == target_date));
        stats.push(PeriodStat {
            key,
            target_date,
            qualified,
            recorded_at,
        });
    }

    /// Overwrite a member's heartbeat, e.g. to simulate a crashed process.
    pub fn set_member_heartbeat(&self, member_id: MemberId, last_heartbeat_at: DateTime<Utc>) {
        if let Some(member) = self
            .members
            .lock()
            .expect("members poisoned")
            .get_mut(&member_id)
        {
            member.last_heartbeat_at = last_heartbeat_at;
        }
    }

    pub fn executions(&self) -> Vec<BatchExecution> {
        self.executions
            .lock()
            .expect("executions poisoned")
            .clone()
    }

    pub fn chunk_records(&self) -> Vec<ChunkRecord> {
        self.chunks.lock().expect("chunks poisoned").clone()
    }

    pub fn badge_results(&self, execution_id: ExecutionId) -> Vec<BadgeResult> {
        self.badge_results
            .lock()
            .expect("badge results poisoned")
            .values()
            .filter(|row| row.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn level_results(&self, execution_id: ExecutionId) -> Vec<LevelResult> {
        self.level_results
            .lock()
            .expect("level results poisoned")
            .values()
            .filter(|row| row.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn user_tier(&self, user_id: i64) -> Option<Tier> {
        self.users
            .lock()
            .expect("users poisoned")
            .get(&user_id)
            .map(|user| user.tier)
    }

    pub fn user_badge(&self, user_id: i64, category_id: i64) -> Option<BadgeState> {
        self.user_badges
            .lock()
            .expect("user badges poisoned")
            .get(&(user_id, category_id))
            .copied()
    }

    /// Live badge table, keyed by (user, category).
    pub fn user_badges(&self) -> BTreeMap<(i64, i64), BadgeState> {
        self.user_badges
            .lock()
            .expect("user badges poisoned")
            .clone()
    }

    pub fn user_tiers(&self) -> BTreeMap<i64, Tier> {
        self.users
            .lock()
            .expect("users poisoned")
            .iter()
            .map(|(user_id, user)| (*user_id, user.tier))
            .collect()
    }

    pub fn coupons(&self, execution_id: ExecutionId) -> Vec<Entitlement> {
        self.coupons
            .lock()
            .expect("coupons poisoned")
            .iter()
            .filter(|((id, _), _)| *id == execution_id)
            .map(|(_, entitlement)| entitlement.clone())
            .collect()
    }

    pub fn badge_change_logs(&self) -> Vec<BadgeChangeLog> {
        self.badge_logs.lock().expect("badge logs poisoned").clone()
    }

    pub fn tier_change_logs(&self) -> Vec<TierChangeLog> {
        self.tier_logs.lock().expect("tier logs poisoned").clone()
    }
}

fn alive_member_ids(
    members: &BTreeMap<MemberId, ClusterMember>,
    alive_since: DateTime<Utc>,
) -> HashSet<MemberId> {
    members
        .values()
        .filter(|member| member.is_alive_since(alive_since))
        .map(|member| member.member_id)
        .collect()
}

fn date_has_active_run(
    executions: &[BatchExecution],
    target_date: NaiveDate,
    except: Option<ExecutionId>,
) -> bool {
    executions.iter().any(|execution| {
        execution.target_date == target_date
            && execution.status.is_active()
            && Some(execution.execution_id) != except
    })
}

/// The execution if it is active and still owned by `owner`.
fn owned_active(
    executions: &mut [BatchExecution],
    execution_id: ExecutionId,
    owner: MemberId,
) -> Option<&mut BatchExecution> {
    executions.iter_mut().find(|execution| {
        execution.execution_id == execution_id
            && execution.status.is_active()
            && execution.owner_member_id == Some(owner)
    })
}

#[async_trait]
impl MembershipBackend for MemoryBackend {
    async fn register_member(
        &self,
        registration: &MemberRegistration,
        now: DateTime<Utc>,
    ) -> BackendResult<ClusterMember> {
        let mut members = self.members.lock().expect("members poisoned");
        let member = members
            .entry(registration.member_id)
            .or_insert_with(|| ClusterMember {
                member_id: registration.member_id,
                registered_at: now,
                last_heartbeat_at: now,
                process_index: registration.process_index,
                address: registration.address.clone(),
            });
        member.last_heartbeat_at = now;
        member.process_index = registration.process_index;
        member.address = registration.address.clone();
        Ok(member.clone())
    }

    async fn heartbeat_member(
        &self,
        member_id: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let mut members = self.members.lock().expect("members poisoned");
        let member = members
            .get_mut(&member_id)
            .ok_or_else(|| BackendError::Message(format!("member {member_id} not registered")))?;
        member.last_heartbeat_at = now;
        Ok(())
    }

    async fn list_alive_members(
        &self,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<Vec<ClusterMember>> {
        let members = self.members.lock().expect("members poisoned");
        let mut alive: Vec<ClusterMember> = members
            .values()
            .filter(|member| member.is_alive_since(alive_since))
            .cloned()
            .collect();
        alive.sort_by_key(|member| (member.process_index, member.member_id));
        Ok(alive)
    }
}

#[async_trait]
impl ExecutionLogBackend for MemoryBackend {
    async fn claim_execution(
        &self,
        claim: &ExecutionClaim,
    ) -> BackendResult<Option<BatchExecution>> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        if date_has_active_run(&executions, claim.target_date, None) {
            return Ok(None);
        }
        let execution = claim.clone().into_execution();
        executions.push(execution.clone());
        Ok(Some(execution))
    }

    async fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> BackendResult<Option<BatchExecution>> {
        Ok(self
            .executions
            .lock()
            .expect("executions poisoned")
            .iter()
            .find(|execution| execution.execution_id == execution_id)
            .cloned())
    }

    async fn list_executions(&self, target_date: NaiveDate) -> BackendResult<Vec<BatchExecution>> {
        let mut executions: Vec<BatchExecution> = self
            .executions
            .lock()
            .expect("executions poisoned")
            .iter()
            .filter(|execution| execution.target_date == target_date)
            .cloned()
            .collect();
        executions.sort_by_key(|execution| (execution.started_at, execution.execution_id));
        Ok(executions)
    }

    async fn mark_completed(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let Some(execution) = owned_active(&mut executions, execution_id, owner) else {
            return Ok(false);
        };
        execution.status = BatchStatus::Completed;
        execution.ended_at = Some(now);
        Ok(true)
    }

    async fn mark_interrupted(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        cause: InterruptCause,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let Some(execution) = owned_active(&mut executions, execution_id, owner) else {
            return Ok(false);
        };
        execution.status = BatchStatus::Interrupted;
        execution.interrupted = true;
        execution.interrupt_cause = Some(cause);
        execution.interrupted_at = Some(now);
        execution.ended_at = Some(now);
        Ok(true)
    }

    async fn has_completed_execution(&self, target_date: NaiveDate) -> BackendResult<bool> {
        Ok(self
            .executions
            .lock()
            .expect("executions poisoned")
            .iter()
            .any(|execution| {
                execution.target_date == target_date
                    && execution.status == BatchStatus::Completed
            }))
    }

    async fn count_alive_active_owners(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
    ) -> BackendResult<usize> {
        let members = self.members.lock().expect("members poisoned");
        let executions = self.executions.lock().expect("executions poisoned");
        let alive = alive_member_ids(&members, alive_since);
        let owners: HashSet<MemberId> = executions
            .iter()
            .filter(|execution| {
                execution.target_date == target_date && execution.status.is_active()
            })
            .filter_map(|execution| execution.owner_member_id)
            .filter(|owner| alive.contains(owner))
            .collect();
        Ok(owners.len())
    }

    async fn interrupt_orphaned_executions(
        &self,
        target_date: NaiveDate,
        alive_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BackendResult<usize> {
        let members = self.members.lock().expect("members poisoned");
        let mut executions = self.executions.lock().expect("executions poisoned");
        let alive = alive_member_ids(&members, alive_since);
        let mut orphaned = 0;
        for execution in executions.iter_mut() {
            if execution.target_date != target_date || !execution.status.is_active() {
                continue;
            }
            let owner_alive = execution
                .owner_member_id
                .is_some_and(|owner| alive.contains(&owner));
            if owner_alive {
                continue;
            }
            execution.status = BatchStatus::Interrupted;
            execution.interrupted = true;
            execution.interrupt_cause = Some(InterruptCause::OwnerLost);
            execution.interrupted_at = Some(now);
            execution.ended_at = Some(now);
            orphaned += 1;
        }
        Ok(orphaned)
    }

    async fn list_restorable_executions(
        &self,
        target_date: NaiveDate,
    ) -> BackendResult<Vec<BatchExecution>> {
        let executions = self.executions.lock().expect("executions poisoned");
        let completed = executions.iter().any(|execution| {
            execution.target_date == target_date && execution.status == BatchStatus::Completed
        });
        if completed {
            return Ok(Vec::new());
        }
        let mut candidates: Vec<BatchExecution> = executions
            .iter()
            .filter(|execution| {
                execution.target_date == target_date
                    && execution.status == BatchStatus::Interrupted
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|execution| (execution.started_at, execution.execution_id));
        Ok(candidates)
    }

    async fn acquire_restore(
        &self,
        execution_id: ExecutionId,
        owner: MemberId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let Some(target_date) = executions
            .iter()
            .find(|execution| {
                execution.execution_id == execution_id
                    && execution.status == BatchStatus::Interrupted
            })
            .map(|execution| execution.target_date)
        else {
            return Ok(false);
        };
        if date_has_active_run(&executions, target_date, Some(execution_id)) {
            return Ok(false);
        }
        let Some(execution) = executions
            .iter_mut()
            .find(|execution| execution.execution_id == execution_id)
        else {
            return Ok(false);
        };
        execution.status = BatchStatus::Restoring;
        execution.restored_at = Some(now);
        execution.ended_at = None;
        execution.owner_member_id = Some(owner);
        Ok(true)
    }
}

#[async_trait]
impl ChunkLedgerBackend for MemoryBackend {
    async fn record_chunk(&self, record: &ChunkRecord) -> BackendResult<()> {
        let mut chunks = self.chunks.lock().expect("chunks poisoned");
        if let Some(existing) = chunks.iter_mut().find(|existing| {
            existing.execution_id == record.execution_id
                && existing.step == record.step
                && existing.range == record.range
        }) {
            if !existing.completed {
                *existing = record.clone();
            }
            return Ok(());
        }
        chunks.push(record.clone());
        Ok(())
    }

    async fn completed_ranges(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRange>> {
        Ok(self
            .chunks
            .lock()
            .expect("chunks poisoned")
            .iter()
            .filter(|record| {
                record.execution_id == execution_id && record.step == step && record.completed
            })
            .map(|record| record.range)
            .collect())
    }

    async fn list_chunks(
        &self,
        execution_id: ExecutionId,
        step: StepType,
    ) -> BackendResult<Vec<ChunkRecord>> {
        let mut records: Vec<ChunkRecord> = self
            .chunks
            .lock()
            .expect("chunks poisoned")
            .iter()
            .filter(|record| record.execution_id == execution_id && record.step == step)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.range.start);
        Ok(records)
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn materialize_subjects(
        &self,
        execution_id: ExecutionId,
        subjects: &[Subject],
    ) -> BackendResult<()> {
        if subjects.is_empty() {
            return Ok(());
        }
        self.subjects
            .lock()
            .expect("subjects poisoned")
            .entry(execution_id)
            .or_insert_with(|| subjects.to_vec());
        Ok(())
    }

    async fn materialized_subjects(
        &self,
        execution_id: ExecutionId,
    ) -> BackendResult<Option<Vec<Subject>>> {
        Ok(self
            .subjects
            .lock()
            .expect("subjects poisoned")
            .get(&execution_id)
            .cloned())
    }

    async fn write_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeComputation],
    ) -> BackendResult<usize> {
        let mut rows = self.badge_results.lock().expect("badge results poisoned");
        let mut written = 0;
        for result in results {
            let key = (execution_id, result.key.user_id, result.key.category_id);
            if rows.contains_key(&key) {
                continue;
            }
            rows.insert(
                key,
                BadgeResult {
                    execution_id,
                    user_id: result.key.user_id,
                    category_id: result.key.category_id,
                    new_state: result.new_state,
                    status: SnapshotStatus::Pending,
                    applied_at: None,
                },
            );
            written += 1;
        }
        Ok(written)
    }

    async fn write_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelComputation],
    ) -> BackendResult<usize> {
        let mut rows = self.level_results.lock().expect("level results poisoned");
        let mut written = 0;
        for result in results {
            let key = (execution_id, result.user_id);
            if rows.contains_key(&key) {
                continue;
            }
            rows.insert(
                key,
                LevelResult {
                    execution_id,
                    user_id: result.user_id,
                    new_tier: result.new_tier,
                    status: SnapshotStatus::Pending,
                    applied_at: None,
                },
            );
            written += 1;
        }
        Ok(written)
    }

    async fn pending_badge_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<BadgeResult>> {
        Ok(self
            .badge_results
            .lock()
            .expect("badge results poisoned")
            .range((execution_id, users.first, i64::MIN)..=(execution_id, users.last, i64::MAX))
            .map(|(_, row)| row)
            .filter(|row| row.status == SnapshotStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_level_results(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<LevelResult>> {
        Ok(self
            .level_results
            .lock()
            .expect("level results poisoned")
            .range((execution_id, users.first)..=(execution_id, users.last))
            .map(|(_, row)| row)
            .filter(|row| row.status == SnapshotStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn apply_badge_results(
        &self,
        execution_id: ExecutionId,
        results: &[BadgeResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome> {
        let users = self.users.lock().expect("users poisoned");
        let mut user_badges = self.user_badges.lock().expect("user badges poisoned");
        let mut rows = self.badge_results.lock().expect("badge results poisoned");
        let mut logs = self.badge_logs.lock().expect("badge logs poisoned");

        let mut outcome = ApplyOutcome::default();
        for result in results {
            let key = (execution_id, result.user_id, result.category_id);
            let Some(row) = rows.get_mut(&key) else {
                continue;
            };
            if row.status != SnapshotStatus::Pending {
                continue;
            }
            if !users.contains_key(&result.user_id) {
                row.status = SnapshotStatus::Failed;
                outcome.failed += 1;
                continue;
            }
            let previous = apply_computed_badge_state(
                &mut user_badges,
                result.user_id,
                result.category_id,
                row.new_state,
            );
            if previous != Some(row.new_state) {
                logs.push(BadgeChangeLog {
                    execution_id,
                    user_id: result.user_id,
                    category_id: result.category_id,
                    previous_state: previous,
                    new_state: row.new_state,
                    changed_at: now,
                });
            }
            row.status = SnapshotStatus::Applied;
            row.applied_at = Some(now);
            outcome.applied += 1;
        }
        Ok(outcome)
    }

    async fn apply_level_results(
        &self,
        execution_id: ExecutionId,
        results: &[LevelResult],
        now: DateTime<Utc>,
    ) -> BackendResult<ApplyOutcome> {
        let mut users = self.users.lock().expect("users poisoned");
        let mut rows = self.level_results.lock().expect("level results poisoned");
        let mut logs = self.tier_logs.lock().expect("tier logs poisoned");

        let mut outcome = ApplyOutcome::default();
        for result in results {
            let Some(row) = rows.get_mut(&(execution_id, result.user_id)) else {
                continue;
            };
            if row.status != SnapshotStatus::Pending {
                continue;
            }
            let Some(previous) = apply_computed_tier(&mut users, result.user_id, row.new_tier)
            else {
                row.status = SnapshotStatus::Failed;
                outcome.failed += 1;
                continue;
            };
            if previous != row.new_tier {
                logs.push(TierChangeLog {
                    execution_id,
                    user_id: result.user_id,
                    previous_tier: previous,
                    new_tier: row.new_tier,
                    changed_at: now,
                });
            }
            row.status = SnapshotStatus::Applied;
            row.applied_at = Some(now);
            outcome.applied += 1;
        }
        Ok(outcome)
    }

    async fn snapshot_counts(&self, execution_id: ExecutionId) -> BackendResult<SnapshotCounts> {
        let mut counts = SnapshotCounts::default();
        for row in self
            .badge_results
            .lock()
            .expect("badge results poisoned")
            .values()
            .filter(|row| row.execution_id == execution_id)
        {
            counts.badges.add(row.status);
        }
        for row in self
            .level_results
            .lock()
            .expect("level results poisoned")
            .values()
            .filter(|row| row.execution_id == execution_id)
        {
            counts.levels.add(row.status);
        }
        Ok(counts)
    }
}

/// Returns the previous live state, if any.
fn apply_computed_badge_state(
    user_badges: &mut BTreeMap<(i64, i64), BadgeState>,
    user_id: i64,
    category_id: i64,
    new_state: BadgeState,
) -> Option<BadgeState> {
    user_badges.insert((user_id, category_id), new_state)
}

/// Returns the previous tier, or `None` when the user no longer exists.
fn apply_computed_tier(
    users: &mut BTreeMap<i64, MemoryUser>,
    user_id: i64,
    new_tier: Tier,
) -> Option<Tier> {
    let user = users.get_mut(&user_id)?;
    Some(std::mem::replace(&mut user.tier, new_tier))
}

#[async_trait]
impl SubjectSource for MemoryBackend {
    async fn read_all_subjects(&self) -> BackendResult<Vec<Subject>> {
        Ok(self
            .users
            .lock()
            .expect("users poisoned")
            .iter()
            .map(|(user_id, user)| Subject::new(*user_id, user.category_ids.clone()))
            .collect())
    }

    async fn read_period_statistics(
        &self,
        target_date: NaiveDate,
        cutoff: DateTime<Utc>,
    ) -> BackendResult<HashMap<SubjectKey, bool>> {
        Ok(self
            .period_stats
            .lock()
            .expect("period stats poisoned")
            .iter()
            .filter(|stat| stat.target_date == target_date && stat.recorded_at <= cutoff)
            .map(|stat| (stat.key, stat.qualified))
            .collect())
    }

    async fn count_active_badges(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, usize>> {
        let wanted: HashSet<i64> = user_ids.iter().copied().collect();
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for ((user_id, _), state) in self.user_badges.lock().expect("user badges poisoned").iter()
        {
            if *state == BadgeState::Active && wanted.contains(user_id) {
                *counts.entry(*user_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn load_tiers(&self, user_ids: &[i64]) -> BackendResult<HashMap<i64, Tier>> {
        let users = self.users.lock().expect("users poisoned");
        Ok(user_ids
            .iter()
            .filter_map(|user_id| users.get(user_id).map(|user| (*user_id, user.tier)))
            .collect())
    }
}

#[async_trait]
impl EntitlementBackend for MemoryBackend {
    async fn issue_entitlements(
        &self,
        execution_id: ExecutionId,
        entitlements: &[Entitlement],
        _batch_size: usize,
        _now: DateTime<Utc>,
    ) -> BackendResult<usize> {
        let mut coupons = self.coupons.lock().expect("coupons poisoned");
        let mut issued = 0;
        for entitlement in entitlements {
            let key = (execution_id, entitlement.user_id);
            if coupons.contains_key(&key) {
                continue;
            }
            coupons.insert(key, entitlement.clone());
            issued += 1;
        }
        Ok(issued)
    }
}
