//! Batch orchestrator: claims a target date and drives one run through the
//! read, snapshot, apply and coupon phases.
//!
//! Every phase is resumable. Snapshot and coupon steps go through the
//! chunk ledger, apply steps drain whatever is still pending in the
//! snapshot tables, and the input subject set is materialized once per run.
//! Any phase failure moves the run to interrupted and is returned to the
//! caller, which owns cluster-wide cleanup.

mod phases;
mod service;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{error, info, warn};

use crate::backends::{BackendError, BatchBackend};
use crate::cluster::{CoordinationFlags, NotifyError};
use crate::domain::{BatchRules, Subject, SubjectKey};
use crate::executor::{
    ChunkedExecutor, ExecutorConfig, ExecutorError, StepContext, StepSummary, run_apply,
};
use crate::models::{BatchExecution, ExecutionClaim, ExecutionId, InterruptCause, MemberId, StepType};
use crate::observability::obs;

pub use phases::BatchPhase;
pub use service::BatchService;

use phases::{BadgeApplier, BadgeSnapshotOp, CouponOp, LevelApplier, LevelSnapshotOp};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("execution {execution_id} interrupted by scale-out during {phase}")]
    ScaleOut {
        execution_id: ExecutionId,
        phase: BatchPhase,
    },
    #[error("execution {execution_id} failed during {phase}: {source}")]
    Stage {
        execution_id: ExecutionId,
        phase: BatchPhase,
        #[source]
        source: ExecutorError,
    },
    #[error("execution {execution_id} backend failure during {phase}: {source}")]
    Backend {
        execution_id: ExecutionId,
        phase: BatchPhase,
        #[source]
        source: BackendError,
    },
    #[error("execution {execution_id} is no longer owned by this member at {phase}")]
    OwnershipLost {
        execution_id: ExecutionId,
        phase: BatchPhase,
    },
    #[error("failed to claim batch for {target_date}: {source}")]
    Claim {
        target_date: NaiveDate,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Notification(#[from] NotifyError),
}

impl BatchError {
    pub fn is_scale_out(&self) -> bool {
        matches!(self, Self::ScaleOut { .. })
    }

    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, Self::OwnershipLost { .. })
    }

    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            Self::ScaleOut { execution_id, .. }
            | Self::Stage { execution_id, .. }
            | Self::Backend { execution_id, .. }
            | Self::OwnershipLost { execution_id, .. } => Some(*execution_id),
            Self::Claim { .. } | Self::Notification(_) => None,
        }
    }
}

/// Attempts at moving a failed run to interrupted before giving up.
const INTERRUPT_WRITE_ATTEMPTS: u32 = 3;
const INTERRUPT_WRITE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub executor: ExecutorConfig,
    /// Apply page size and coupon insert batch when the caller passes none.
    pub default_batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            default_batch_size: 500,
        }
    }
}

/// What one run finished with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub subjects: usize,
    pub badge_snapshot: StepSummary,
    pub badges_applied: usize,
    pub level_snapshot: StepSummary,
    pub tiers_applied: usize,
    pub coupon: StepSummary,
}

/// Sequences the phases of a run for one process.
pub struct BatchOrchestrator<B: BatchBackend> {
    backend: B,
    rules: Arc<dyn BatchRules>,
    flags: Arc<CoordinationFlags>,
    executor: ChunkedExecutor<B>,
    member_id: MemberId,
    config: OrchestratorConfig,
}

impl<B: BatchBackend> BatchOrchestrator<B> {
    pub fn new(
        backend: B,
        rules: Arc<dyn BatchRules>,
        flags: Arc<CoordinationFlags>,
        config: OrchestratorConfig,
        member_id: MemberId,
    ) -> Self {
        let executor = ChunkedExecutor::new(
            backend.clone(),
            Arc::clone(&flags),
            config.executor.clone(),
            member_id,
        );
        Self {
            backend,
            rules,
            flags,
            executor,
            member_id,
            config,
        }
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Claim `target_date` and run it to completion.
    ///
    /// Returns `Ok(false)` without side effects when another run already
    /// holds the date.
    #[obs]
    pub async fn run_full_batch(
        &self,
        target_date: NaiveDate,
        batch_size: Option<usize>,
    ) -> Result<bool, BatchError> {
        let now = Utc::now();
        let claim = ExecutionClaim {
            execution_id: ExecutionId::new(),
            target_date,
            cutoff_at: now,
            owner: self.member_id,
            started_at: now,
        };
        let execution = self
            .backend
            .claim_execution(&claim)
            .await
            .map_err(|source| BatchError::Claim {
                target_date,
                source,
            })?;
        let Some(execution) = execution else {
            info!(target_date = %target_date, "batch already claimed, skipping");
            return Ok(false);
        };

        info!(
            execution_id = %execution.execution_id,
            target_date = %target_date,
            "claimed batch execution"
        );
        self.drive(&execution, self.batch_size(batch_size), false)
            .await?;
        Ok(true)
    }

    /// Continue a run whose restore has already been acquired.
    #[obs]
    pub async fn resume(
        &self,
        execution: &BatchExecution,
        batch_size: Option<usize>,
    ) -> Result<RunReport, BatchError> {
        info!(
            execution_id = %execution.execution_id,
            target_date = %execution.target_date,
            "resuming batch execution"
        );
        self.drive(execution, self.batch_size(batch_size), true)
            .await
    }

    fn batch_size(&self, batch_size: Option<usize>) -> usize {
        batch_size
            .unwrap_or(self.config.default_batch_size)
            .max(1)
    }

    async fn drive(
        &self,
        execution: &BatchExecution,
        batch_size: usize,
        restoring: bool,
    ) -> Result<RunReport, BatchError> {
        let execution_id = execution.execution_id;
        let outcome = match self.run_phases(execution, batch_size, restoring).await {
            Ok(report) => self.finalize(execution_id, report).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &outcome {
            self.record_interruption(execution_id, err).await;
        }
        outcome
    }

    async fn finalize(
        &self,
        execution_id: ExecutionId,
        report: RunReport,
    ) -> Result<RunReport, BatchError> {
        let phase = BatchPhase::Finalize;
        let completed = self
            .backend
            .mark_completed(execution_id, self.member_id, Utc::now())
            .await
            .map_err(|source| BatchError::Backend {
                execution_id,
                phase,
                source,
            })?;
        if !completed {
            return Err(BatchError::OwnershipLost {
                execution_id,
                phase,
            });
        }
        info!(
            execution_id = %execution_id,
            subjects = report.subjects,
            badges_applied = report.badges_applied,
            tiers_applied = report.tiers_applied,
            "batch execution completed"
        );
        Ok(report)
    }

    /// Move a failed run to interrupted so restore can pick it up.
    ///
    /// A run this member no longer owns is left to its new owner. When every
    /// write attempt fails the run stays active under this member until the
    /// next restore tick finds it stranded.
    async fn record_interruption(&self, execution_id: ExecutionId, err: &BatchError) {
        if err.is_ownership_lost() {
            warn!(
                execution_id = %execution_id,
                error = %err,
                "batch execution taken over by another member"
            );
            return;
        }
        let cause = if err.is_scale_out() {
            InterruptCause::ScaleOut
        } else {
            InterruptCause::Failure
        };
        error!(
            execution_id = %execution_id,
            cause = cause.as_str(),
            error = %err,
            "batch execution interrupted"
        );

        for attempt in 1..=INTERRUPT_WRITE_ATTEMPTS {
            match self
                .backend
                .mark_interrupted(execution_id, self.member_id, cause, Utc::now())
                .await
            {
                Ok(true) => return,
                Ok(false) => {
                    warn!(
                        execution_id = %execution_id,
                        "execution no longer owned, leaving it to its owner"
                    );
                    return;
                }
                Err(mark_err) => {
                    warn!(
                        execution_id = %execution_id,
                        attempt,
                        error = %mark_err,
                        "failed to mark execution interrupted"
                    );
                    if attempt < INTERRUPT_WRITE_ATTEMPTS {
                        tokio::time::sleep(INTERRUPT_WRITE_BACKOFF * attempt).await;
                    }
                }
            }
        }
        error!(
            execution_id = %execution_id,
            "execution left active, restore will reclaim it"
        );
    }

    async fn run_phases(
        &self,
        execution: &BatchExecution,
        batch_size: usize,
        restoring: bool,
    ) -> Result<RunReport, BatchError> {
        let execution_id = execution.execution_id;
        let subjects = self.load_subjects(execution_id).await?;
        if subjects.is_empty() {
            info!(execution_id = %execution_id, "no subjects to process");
            return Ok(RunReport::default());
        }

        let mut user_ids: Vec<i64> = subjects.iter().map(|subject| subject.user_id).collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        let mut report = RunReport {
            subjects: user_ids.len(),
            ..RunReport::default()
        };

        report.badge_snapshot = self
            .badge_snapshot(execution, &subjects, restoring)
            .await?;
        report.badges_applied = self
            .apply_badges(execution_id, &user_ids, batch_size)
            .await?;
        report.level_snapshot = self
            .level_snapshot(execution_id, &user_ids, restoring)
            .await?;
        report.tiers_applied = self
            .apply_levels(execution_id, &user_ids, batch_size)
            .await?;
        report.coupon = self
            .issue_coupons(execution_id, &user_ids, batch_size, restoring)
            .await?;
        Ok(report)
    }

    /// The run's materialized subject set, materializing the live set on the
    /// first attempt.
    #[obs]
    async fn load_subjects(&self, execution_id: ExecutionId) -> Result<Vec<Subject>, BatchError> {
        let backend_err = |source| BatchError::Backend {
            execution_id,
            phase: BatchPhase::Read,
            source,
        };
        if let Some(subjects) = self
            .backend
            .materialized_subjects(execution_id)
            .await
            .map_err(backend_err)?
        {
            return Ok(subjects);
        }

        let live = self
            .backend
            .read_all_subjects()
            .await
            .map_err(backend_err)?;
        if live.is_empty() {
            return Ok(live);
        }
        self.backend
            .materialize_subjects(execution_id, &live)
            .await
            .map_err(backend_err)?;
        // A concurrent attempt may have materialized first; its set wins.
        Ok(self
            .backend
            .materialized_subjects(execution_id)
            .await
            .map_err(backend_err)?
            .unwrap_or(live))
    }

    #[obs]
    async fn badge_snapshot(
        &self,
        execution: &BatchExecution,
        subjects: &[Subject],
        restoring: bool,
    ) -> Result<StepSummary, BatchError> {
        let execution_id = execution.execution_id;
        let phase = BatchPhase::BadgeSnapshot;
        self.check_boundary(execution_id, phase).await?;

        let qualified = self
            .backend
            .read_period_statistics(execution.target_date, execution.cutoff_at)
            .await
            .map_err(|source| BatchError::Backend {
                execution_id,
                phase,
                source,
            })?;
        let keys: Vec<SubjectKey> = subjects
            .iter()
            .flat_map(|subject| subject.badge_keys())
            .collect();
        let operation = Arc::new(BadgeSnapshotOp {
            backend: self.backend.clone(),
            rules: Arc::clone(&self.rules),
            execution_id,
            qualified: Arc::new(qualified),
        });
        self.executor
            .run(self.step_context(execution_id, StepType::Badge, restoring), keys, operation)
            .await
            .map_err(|err| self.stage_error(execution_id, phase, err))
    }

    #[obs]
    async fn apply_badges(
        &self,
        execution_id: ExecutionId,
        user_ids: &[i64],
        batch_size: usize,
    ) -> Result<usize, BatchError> {
        let phase = BatchPhase::BadgeApply;
        self.check_boundary(execution_id, phase).await?;
        let applier = Arc::new(BadgeApplier {
            backend: self.backend.clone(),
        });
        let summary = run_apply(
            StepType::Badge,
            execution_id,
            user_ids,
            batch_size,
            applier,
            Arc::clone(&self.flags),
            &self.config.executor,
            self.member_id,
        )
        .await
        .map_err(|err| self.stage_error(execution_id, phase, err))?;
        if summary.failed > 0 {
            warn!(
                execution_id = %execution_id,
                failed = summary.failed,
                "badge rows failed to apply"
            );
        }
        Ok(summary.applied)
    }

    #[obs]
    async fn level_snapshot(
        &self,
        execution_id: ExecutionId,
        user_ids: &[i64],
        restoring: bool,
    ) -> Result<StepSummary, BatchError> {
        let phase = BatchPhase::LevelSnapshot;
        self.check_boundary(execution_id, phase).await?;
        let operation = Arc::new(LevelSnapshotOp {
            backend: self.backend.clone(),
            rules: Arc::clone(&self.rules),
            execution_id,
        });
        self.executor
            .run(
                self.step_context(execution_id, StepType::Level, restoring),
                user_ids.to_vec(),
                operation,
            )
            .await
            .map_err(|err| self.stage_error(execution_id, phase, err))
    }

    #[obs]
    async fn apply_levels(
        &self,
        execution_id: ExecutionId,
        user_ids: &[i64],
        batch_size: usize,
    ) -> Result<usize, BatchError> {
        let phase = BatchPhase::LevelApply;
        self.check_boundary(execution_id, phase).await?;
        let applier = Arc::new(LevelApplier {
            backend: self.backend.clone(),
        });
        let summary = run_apply(
            StepType::Level,
            execution_id,
            user_ids,
            batch_size,
            applier,
            Arc::clone(&self.flags),
            &self.config.executor,
            self.member_id,
        )
        .await
        .map_err(|err| self.stage_error(execution_id, phase, err))?;
        if summary.failed > 0 {
            warn!(
                execution_id = %execution_id,
                failed = summary.failed,
                "tier rows failed to apply"
            );
        }
        Ok(summary.applied)
    }

    #[obs]
    async fn issue_coupons(
        &self,
        execution_id: ExecutionId,
        user_ids: &[i64],
        batch_size: usize,
        restoring: bool,
    ) -> Result<StepSummary, BatchError> {
        let phase = BatchPhase::Coupon;
        self.check_boundary(execution_id, phase).await?;
        let operation = Arc::new(CouponOp {
            backend: self.backend.clone(),
            rules: Arc::clone(&self.rules),
            execution_id,
            batch_size,
        });
        self.executor
            .run(
                self.step_context(execution_id, StepType::Coupon, restoring),
                user_ids.to_vec(),
                operation,
            )
            .await
            .map_err(|err| self.stage_error(execution_id, phase, err))
    }

    fn step_context(
        &self,
        execution_id: ExecutionId,
        step: StepType,
        restoring: bool,
    ) -> StepContext {
        StepContext {
            execution_id,
            step,
            restoring,
        }
    }

    /// Phase boundary: stop on the scale-out latch, or when the run has been
    /// interrupted or handed to another member since this phase began.
    async fn check_boundary(
        &self,
        execution_id: ExecutionId,
        phase: BatchPhase,
    ) -> Result<(), BatchError> {
        if self.flags.is_scale_out_raised() {
            return Err(BatchError::ScaleOut {
                execution_id,
                phase,
            });
        }
        let execution = self
            .backend
            .get_execution(execution_id)
            .await
            .map_err(|source| BatchError::Backend {
                execution_id,
                phase,
                source,
            })?;
        let owned = execution.is_some_and(|execution| {
            execution.status.is_active() && execution.owner_member_id == Some(self.member_id)
        });
        if !owned {
            return Err(BatchError::OwnershipLost {
                execution_id,
                phase,
            });
        }
        Ok(())
    }

    /// A stage that stopped on the latch, or failed while the latch was up,
    /// counts as a scale-out interruption.
    fn stage_error(
        &self,
        execution_id: ExecutionId,
        phase: BatchPhase,
        err: ExecutorError,
    ) -> BatchError {
        if err.is_interrupted() || self.flags.is_scale_out_raised() {
            return BatchError::ScaleOut {
                execution_id,
                phase,
            };
        }
        BatchError::Stage {
            execution_id,
            phase,
            source: err,
        }
    }
}
