//! Persisted records for batch runs, the chunk ledger, snapshot results and
//! cluster membership.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{BadgeState, Tier};

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one process in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Lifecycle of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Interrupted,
    Restoring,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Restoring => "restoring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "restoring" => Some(Self::Restoring),
            _ => None,
        }
    }

    /// Running and restoring runs hold the target date's claim.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Restoring)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was moved to [`BatchStatus::Interrupted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptCause {
    ScaleOut,
    Failure,
    OwnerLost,
}

impl InterruptCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleOut => "scale_out",
            Self::Failure => "failure",
            Self::OwnerLost => "owner_lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scale_out" => Some(Self::ScaleOut),
            "failure" => Some(Self::Failure),
            "owner_lost" => Some(Self::OwnerLost),
            _ => None,
        }
    }
}

impl fmt::Display for InterruptCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chunked step a ledger row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Badge,
    Level,
    Coupon,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Badge => "badge",
            Self::Level => "level",
            Self::Coupon => "coupon",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "badge" => Some(Self::Badge),
            "level" => Some(Self::Level),
            "coupon" => Some(Self::Coupon),
            _ => None,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a staged snapshot row. Only `Pending` rows may transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Applied,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "applied" => Some(Self::Applied),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Chunk ranges
// ============================================================================

/// Composite sort key of a work item: subject id, then sub-key (category id,
/// or zero for per-subject steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub primary: i64,
    pub secondary: i64,
}

impl ChunkKey {
    pub fn new(primary: i64, secondary: i64) -> Self {
        Self { primary, secondary }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.primary, self.secondary)
    }
}

/// Inclusive key range covered by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: ChunkKey,
    pub end: ChunkKey,
}

impl ChunkRange {
    pub fn new(start: ChunkKey, end: ChunkKey) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Inclusive subject-id window an apply worker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRange {
    pub first: i64,
    pub last: i64,
}

impl UserRange {
    pub fn contains(&self, user_id: i64) -> bool {
        self.first <= user_id && user_id <= self.last
    }
}

// ============================================================================
// Model Structs
// ============================================================================

/// One row of the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecution {
    pub execution_id: ExecutionId,
    pub target_date: NaiveDate,
    /// T0: statistics are read as of this instant on every attempt.
    pub cutoff_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub interrupted: bool,
    pub interrupt_cause: Option<InterruptCause>,
    pub interrupted_at: Option<DateTime<Utc>>,
    pub restored_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub owner_member_id: Option<MemberId>,
}

/// Claim request for a target date.
#[derive(Debug, Clone)]
pub struct ExecutionClaim {
    pub execution_id: ExecutionId,
    pub target_date: NaiveDate,
    pub cutoff_at: DateTime<Utc>,
    pub owner: MemberId,
    pub started_at: DateTime<Utc>,
}

impl ExecutionClaim {
    pub fn into_execution(self) -> BatchExecution {
        BatchExecution {
            execution_id: self.execution_id,
            target_date: self.target_date,
            cutoff_at: self.cutoff_at,
            status: BatchStatus::Running,
            interrupted: false,
            interrupt_cause: None,
            interrupted_at: None,
            restored_at: None,
            started_at: self.started_at,
            ended_at: None,
            owner_member_id: Some(self.owner),
        }
    }
}

/// One row of the chunk completion ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub execution_id: ExecutionId,
    pub step: StepType,
    pub worker_id: String,
    pub recorded_at: DateTime<Utc>,
    pub range: ChunkRange,
    pub completed: bool,
    pub restored: bool,
}

/// Staged badge change for one (execution, user, category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadgeResult {
    pub execution_id: ExecutionId,
    pub user_id: i64,
    pub category_id: i64,
    pub new_state: BadgeState,
    pub status: SnapshotStatus,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Staged tier change for one (execution, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelResult {
    pub execution_id: ExecutionId,
    pub user_id: i64,
    pub new_tier: Tier,
    pub status: SnapshotStatus,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Outcome of applying one page of snapshot rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub failed: usize,
}

impl ApplyOutcome {
    pub fn total(&self) -> usize {
        self.applied + self.failed
    }
}

/// Per-status row counts of one snapshot table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub applied: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.applied + self.failed
    }

    pub fn add(&mut self, status: SnapshotStatus) {
        match status {
            SnapshotStatus::Pending => self.pending += 1,
            SnapshotStatus::Applied => self.applied += 1,
            SnapshotStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub badges: StatusCounts,
    pub levels: StatusCounts,
}

impl SnapshotCounts {
    pub fn total(&self) -> usize {
        self.badges.total() + self.levels.total()
    }
}

/// Registration payload for a starting process.
#[derive(Debug, Clone)]
pub struct MemberRegistration {
    pub member_id: MemberId,
    pub process_index: i32,
    pub address: String,
}

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub member_id: MemberId,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub process_index: i32,
    pub address: String,
}

impl ClusterMember {
    /// A member is alive while its last heartbeat is newer than `alive_since`.
    pub fn is_alive_since(&self, alive_since: DateTime<Utc>) -> bool {
        self.last_heartbeat_at > alive_since
    }
}
