//! Per-chunk operations for the snapshot and coupon steps, and the appliers
//! for the two apply steps.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::backends::{BackendResult, BatchBackend};
use crate::domain::{BadgeComputation, BatchRules, LevelComputation, SubjectKey};
use crate::executor::{ChunkError, ChunkOperation, PendingApply};
use crate::models::{ApplyOutcome, BadgeResult, ExecutionId, LevelResult, UserRange};

/// Phases of one run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Read,
    BadgeSnapshot,
    BadgeApply,
    LevelSnapshot,
    LevelApply,
    Coupon,
    Finalize,
}

impl BatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::BadgeSnapshot => "badge_snapshot",
            Self::BadgeApply => "badge_apply",
            Self::LevelSnapshot => "level_snapshot",
            Self::LevelApply => "level_apply",
            Self::Coupon => "coupon",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes badge states for a chunk of (user, category) keys and stages
/// them as pending rows.
pub(crate) struct BadgeSnapshotOp<B> {
    pub backend: B,
    pub rules: Arc<dyn BatchRules>,
    pub execution_id: ExecutionId,
    pub qualified: Arc<HashMap<SubjectKey, bool>>,
}

#[async_trait]
impl<B: BatchBackend> ChunkOperation<SubjectKey> for BadgeSnapshotOp<B> {
    async fn run_chunk(&self, items: &[SubjectKey]) -> Result<(), ChunkError> {
        let computations: Vec<BadgeComputation> = items
            .iter()
            .map(|key| BadgeComputation {
                key: *key,
                new_state: self
                    .rules
                    .badge_state(*key, self.qualified.get(key).copied().unwrap_or(false)),
            })
            .collect();
        self.backend
            .write_badge_results(self.execution_id, &computations)
            .await?;
        Ok(())
    }
}

/// Computes tiers from the live badge table for a chunk of users.
pub(crate) struct LevelSnapshotOp<B> {
    pub backend: B,
    pub rules: Arc<dyn BatchRules>,
    pub execution_id: ExecutionId,
}

#[async_trait]
impl<B: BatchBackend> ChunkOperation<i64> for LevelSnapshotOp<B> {
    async fn run_chunk(&self, items: &[i64]) -> Result<(), ChunkError> {
        let active = self.backend.count_active_badges(items).await?;
        let computations: Vec<LevelComputation> = items
            .iter()
            .map(|user_id| LevelComputation {
                user_id: *user_id,
                new_tier: self
                    .rules
                    .tier_for(*user_id, active.get(user_id).copied().unwrap_or(0)),
            })
            .collect();
        self.backend
            .write_level_results(self.execution_id, &computations)
            .await?;
        Ok(())
    }
}

/// Issues coupons for a chunk of users based on their applied tier.
pub(crate) struct CouponOp<B> {
    pub backend: B,
    pub rules: Arc<dyn BatchRules>,
    pub execution_id: ExecutionId,
    pub batch_size: usize,
}

#[async_trait]
impl<B: BatchBackend> ChunkOperation<i64> for CouponOp<B> {
    async fn run_chunk(&self, items: &[i64]) -> Result<(), ChunkError> {
        let tiers = self.backend.load_tiers(items).await?;
        let entitlements: Vec<_> = items
            .iter()
            .filter_map(|user_id| {
                tiers
                    .get(user_id)
                    .and_then(|tier| self.rules.entitlement_for(*user_id, *tier))
            })
            .collect();
        if entitlements.is_empty() {
            return Ok(());
        }
        self.backend
            .issue_entitlements(
                self.execution_id,
                &entitlements,
                self.batch_size,
                Utc::now(),
            )
            .await?;
        Ok(())
    }
}

pub(crate) struct BadgeApplier<B> {
    pub backend: B,
}

#[async_trait]
impl<B: BatchBackend> PendingApply for BadgeApplier<B> {
    type Row = BadgeResult;

    async fn pending(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<BadgeResult>> {
        self.backend
            .pending_badge_results(execution_id, users, limit)
            .await
    }

    fn user_id(row: &BadgeResult) -> i64 {
        row.user_id
    }

    async fn apply(
        &self,
        execution_id: ExecutionId,
        rows: &[BadgeResult],
    ) -> BackendResult<ApplyOutcome> {
        self.backend
            .apply_badge_results(execution_id, rows, Utc::now())
            .await
    }
}

pub(crate) struct LevelApplier<B> {
    pub backend: B,
}

#[async_trait]
impl<B: BatchBackend> PendingApply for LevelApplier<B> {
    type Row = LevelResult;

    async fn pending(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<LevelResult>> {
        self.backend
            .pending_level_results(execution_id, users, limit)
            .await
    }

    fn user_id(row: &LevelResult) -> i64 {
        row.user_id
    }

    async fn apply(
        &self,
        execution_id: ExecutionId,
        rows: &[LevelResult],
    ) -> BackendResult<ApplyOutcome> {
        self.backend
            .apply_level_results(execution_id, rows, Utc::now())
            .await
    }
}
