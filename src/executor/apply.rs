//! Apply stage: drain pending snapshot rows into live entities, one page per
//! transaction, with one worker per subject-id window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ChunkError, ExecutorConfig, ExecutorError, join_workers, run_with_timeout, user_ranges,
    worker_name,
};
use crate::backends::BackendResult;
use crate::cluster::{CoordinationFlags, InFlightLeases};
use crate::models::{ApplyOutcome, ExecutionId, MemberId, StepType, UserRange};

/// One kind of snapshot row and the transaction that applies it.
#[async_trait]
pub trait PendingApply: Send + Sync + 'static {
    type Row: Send + Sync;

    async fn pending(
        &self,
        execution_id: ExecutionId,
        users: UserRange,
        limit: usize,
    ) -> BackendResult<Vec<Self::Row>>;

    fn user_id(row: &Self::Row) -> i64;

    async fn apply(
        &self,
        execution_id: ExecutionId,
        rows: &[Self::Row],
    ) -> BackendResult<ApplyOutcome>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub pages: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Apply every pending row of `execution_id` for the given subjects.
///
/// `user_ids` must be sorted and deduplicated. Workers check the scale-out
/// latch before each page and hold in-flight leases on the page's subjects
/// while its transaction runs.
#[allow(clippy::too_many_arguments)]
pub async fn run_apply<A: PendingApply>(
    step: StepType,
    execution_id: ExecutionId,
    user_ids: &[i64],
    page_size: usize,
    applier: Arc<A>,
    flags: Arc<CoordinationFlags>,
    config: &ExecutorConfig,
    member_id: MemberId,
) -> Result<ApplySummary, ExecutorError> {
    let cancel = CancellationToken::new();
    let mut workers = JoinSet::new();

    for (index, users) in user_ranges(user_ids, config.workers).into_iter().enumerate() {
        let worker = ApplyWorker {
            step,
            execution_id,
            users,
            page_size: page_size.max(1),
            worker_id: worker_name(member_id, step, index),
            flags: Arc::clone(&flags),
            timeout: config.chunk_timeout,
            cancel: cancel.clone(),
        };
        let applier = Arc::clone(&applier);
        workers.spawn(async move { worker.run(applier).await });
    }

    let reports = join_workers(step, workers, &cancel).await?;
    let summary = reports
        .into_iter()
        .fold(ApplySummary::default(), |mut acc, report| {
            acc.pages += report.pages;
            acc.applied += report.applied;
            acc.failed += report.failed;
            acc
        });
    info!(
        execution_id = %execution_id,
        step = %step,
        applied = summary.applied,
        failed = summary.failed,
        "apply finished"
    );
    Ok(summary)
}

struct ApplyWorker {
    step: StepType,
    execution_id: ExecutionId,
    users: UserRange,
    page_size: usize,
    worker_id: String,
    flags: Arc<CoordinationFlags>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ApplyWorker {
    async fn run<A: PendingApply>(self, applier: Arc<A>) -> Result<ApplySummary, ExecutorError> {
        let mut report = ApplySummary::default();
        let mut stalled = false;
        loop {
            if self.cancel.is_cancelled() {
                debug!(step = %self.step, worker = %self.worker_id, "apply worker cancelled");
                return Ok(report);
            }
            if self.flags.is_scale_out_raised() {
                warn!(
                    step = %self.step,
                    worker = %self.worker_id,
                    "scale-out latch raised, stopping apply"
                );
                return Err(ExecutorError::Interrupted {
                    step: self.step,
                    worker: self.worker_id,
                });
            }

            let page = applier
                .pending(self.execution_id, self.users, self.page_size)
                .await
                .map_err(|err| self.apply_error(err.into()))?;
            if page.is_empty() {
                return Ok(report);
            }

            let mut leases = InFlightLeases::new(&self.flags);
            for row in &page {
                let user_id = A::user_id(row);
                if !leases.acquire(user_id) {
                    return Err(self.apply_error(ChunkError::Rejected(format!(
                        "subject {user_id} is already in flight"
                    ))));
                }
            }
            let outcome = run_with_timeout(self.timeout, async {
                applier
                    .apply(self.execution_id, &page)
                    .await
                    .map_err(ChunkError::from)
            })
            .await;
            drop(leases);

            let outcome = outcome.map_err(|err| self.apply_error(err))?;
            report.pages += 1;
            report.applied += outcome.applied;
            report.failed += outcome.failed;
            // Rows applied elsewhere leave a page with no progress; the next
            // query skips them. Two empty pages in a row means nothing moves.
            if outcome.total() == 0 {
                if stalled {
                    return Err(self.apply_error(ChunkError::Rejected(format!(
                        "{} pending rows did not advance",
                        page.len()
                    ))));
                }
                warn!(
                    step = %self.step,
                    worker = %self.worker_id,
                    rows = page.len(),
                    "pending page made no progress, querying again"
                );
                stalled = true;
            } else {
                stalled = false;
            }
        }
    }

    fn apply_error(&self, source: ChunkError) -> ExecutorError {
        ExecutorError::Apply {
            step: self.step,
            worker: self.worker_id.clone(),
            source,
        }
    }
}
