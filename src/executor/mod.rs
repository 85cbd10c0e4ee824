//! Chunked parallel executor with a resumable chunk ledger.
//!
//! A step's work items are stably sorted, split into `workers` contiguous
//! partitions and each partition is processed as a sequence of `chunk_size`
//! chunks by one worker task. Every chunk is recorded in the ledger once it
//! finishes; a resumed step skips ranges already recorded as completed.

mod apply;
mod partition;
mod pool;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{BackendError, ChunkLedgerBackend};
use crate::cluster::CoordinationFlags;
use crate::domain::SubjectKey;
use crate::models::{ChunkKey, ChunkRange, ChunkRecord, ExecutionId, MemberId, StepType};

pub use apply::{ApplySummary, PendingApply, run_apply};
pub use partition::{ChunkPlan, PartitionPlan, partition_bounds, plan_partitions, user_ranges};

pub(crate) use pool::join_workers;

/// An item the executor can sort and bound chunks by.
pub trait WorkItem: Clone + Send + Sync + 'static {
    fn chunk_key(&self) -> ChunkKey;
}

impl WorkItem for i64 {
    fn chunk_key(&self) -> ChunkKey {
        ChunkKey::new(*self, 0)
    }
}

impl WorkItem for SubjectKey {
    fn chunk_key(&self) -> ChunkKey {
        SubjectKey::chunk_key(self)
    }
}

/// Side-effecting work for one chunk. Each call is its own transaction
/// boundary and must be idempotent for the same items.
#[async_trait]
pub trait ChunkOperation<T>: Send + Sync + 'static {
    async fn run_chunk(&self, items: &[T]) -> Result<(), ChunkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("chunk timed out after {0:?}")]
    TimedOut(Duration),
    #[error("chunk rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("{step} step interrupted by scale-out on worker {worker}")]
    Interrupted { step: StepType, worker: String },
    #[error("{step} chunk {range} failed on worker {worker}: {source}")]
    ChunkFailed {
        step: StepType,
        worker: String,
        range: ChunkRange,
        #[source]
        source: ChunkError,
    },
    #[error("failed to record {step} chunk {range}: {source}")]
    Ledger {
        step: StepType,
        range: ChunkRange,
        #[source]
        source: BackendError,
    },
    #[error("failed to load {step} ledger: {source}")]
    LedgerLoad {
        step: StepType,
        #[source]
        source: BackendError,
    },
    #[error("{step} apply failed on worker {worker}: {source}")]
    Apply {
        step: StepType,
        worker: String,
        #[source]
        source: ChunkError,
    },
    #[error("{step} worker panicked: {message}")]
    WorkerPanicked { step: StepType, message: String },
}

impl ExecutorError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub chunk_size: usize,
    /// `None` lets a chunk run indefinitely.
    pub chunk_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            chunk_size: 1000,
            chunk_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Identifies the ledger rows a step run writes.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub step: StepType,
    /// Marks ledger rows written by a resumed run.
    pub restoring: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSummary {
    pub items: usize,
    pub processed: usize,
    pub skipped: usize,
    pub chunks: usize,
}

#[derive(Debug, Default)]
struct PartitionReport {
    processed: usize,
    skipped: usize,
    chunks: usize,
}

pub(crate) fn worker_name(member_id: MemberId, step: StepType, index: usize) -> String {
    format!("{member_id}:{step}:{index}")
}

pub(crate) async fn run_with_timeout<T, F>(
    timeout: Option<Duration>,
    work: F,
) -> Result<T, ChunkError>
where
    F: std::future::Future<Output = Result<T, ChunkError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or(Err(ChunkError::TimedOut(limit))),
        None => work.await,
    }
}

/// Runs one step of a batch across a fixed set of worker tasks.
#[derive(Clone)]
pub struct ChunkedExecutor<L> {
    ledger: L,
    flags: Arc<CoordinationFlags>,
    config: ExecutorConfig,
    member_id: MemberId,
}

impl<L> ChunkedExecutor<L>
where
    L: ChunkLedgerBackend + Clone + 'static,
{
    pub fn new(
        ledger: L,
        flags: Arc<CoordinationFlags>,
        config: ExecutorConfig,
        member_id: MemberId,
    ) -> Self {
        Self {
            ledger,
            flags,
            config,
            member_id,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Process `items` with `operation`, skipping chunks the ledger already
    /// records as completed for this execution and step.
    pub async fn run<T, O>(
        &self,
        ctx: StepContext,
        mut items: Vec<T>,
        operation: Arc<O>,
    ) -> Result<StepSummary, ExecutorError>
    where
        T: WorkItem,
        O: ChunkOperation<T>,
    {
        items.sort_by_key(|item| item.chunk_key());
        let total = items.len();

        let completed: HashSet<ChunkRange> = self
            .ledger
            .completed_ranges(ctx.execution_id, ctx.step)
            .await
            .map_err(|source| ExecutorError::LedgerLoad {
                step: ctx.step,
                source,
            })?
            .into_iter()
            .collect();
        let completed = Arc::new(completed);

        let plans = plan_partitions(&items, self.config.workers, self.config.chunk_size);
        let items: Arc<[T]> = items.into();
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        for plan in plans {
            if plan.chunks.is_empty() {
                continue;
            }
            let worker = PartitionWorker {
                ctx,
                worker_id: worker_name(self.member_id, ctx.step, plan.index),
                ledger: self.ledger.clone(),
                flags: Arc::clone(&self.flags),
                completed: Arc::clone(&completed),
                timeout: self.config.chunk_timeout,
                cancel: cancel.clone(),
            };
            let items = Arc::clone(&items);
            let operation = Arc::clone(&operation);
            workers.spawn(async move { worker.run(plan, items, operation).await });
        }

        let reports = join_workers(ctx.step, workers, &cancel).await?;
        let summary = reports
            .into_iter()
            .fold(StepSummary { items: total, ..StepSummary::default() }, |mut acc, report| {
                acc.processed += report.processed;
                acc.skipped += report.skipped;
                acc.chunks += report.chunks;
                acc
            });
        info!(
            execution_id = %ctx.execution_id,
            step = %ctx.step,
            items = summary.items,
            processed = summary.processed,
            skipped = summary.skipped,
            "step finished"
        );
        Ok(summary)
    }
}

struct PartitionWorker<L> {
    ctx: StepContext,
    worker_id: String,
    ledger: L,
    flags: Arc<CoordinationFlags>,
    completed: Arc<HashSet<ChunkRange>>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<L: ChunkLedgerBackend> PartitionWorker<L> {
    async fn run<T, O>(
        self,
        plan: PartitionPlan,
        items: Arc<[T]>,
        operation: Arc<O>,
    ) -> Result<PartitionReport, ExecutorError>
    where
        T: WorkItem,
        O: ChunkOperation<T>,
    {
        let step = self.ctx.step;
        let mut report = PartitionReport::default();

        for chunk in plan.chunks {
            if self.cancel.is_cancelled() {
                debug!(step = %step, worker = %self.worker_id, "worker cancelled");
                break;
            }
            if self.completed.contains(&chunk.range) {
                report.skipped += chunk.items.len();
                continue;
            }
            if self.flags.is_scale_out_raised() {
                self.record(chunk.range, false).await?;
                warn!(
                    step = %step,
                    worker = %self.worker_id,
                    range = %chunk.range,
                    "scale-out latch raised, stopping partition"
                );
                return Err(ExecutorError::Interrupted {
                    step,
                    worker: self.worker_id,
                });
            }

            let slice = &items[chunk.items.clone()];
            let result = run_with_timeout(self.timeout, operation.run_chunk(slice)).await;
            match result {
                Ok(()) => {
                    self.record(chunk.range, true).await?;
                    report.processed += slice.len();
                    report.chunks += 1;
                }
                Err(source) => {
                    if let Err(err) = self.record(chunk.range, false).await {
                        warn!(error = %err, "failed to record failed chunk");
                    }
                    return Err(ExecutorError::ChunkFailed {
                        step,
                        worker: self.worker_id,
                        range: chunk.range,
                        source,
                    });
                }
            }
        }
        Ok(report)
    }

    async fn record(&self, range: ChunkRange, completed: bool) -> Result<(), ExecutorError> {
        let record = ChunkRecord {
            execution_id: self.ctx.execution_id,
            step: self.ctx.step,
            worker_id: self.worker_id.clone(),
            recorded_at: Utc::now(),
            range,
            completed,
            restored: self.ctx.restoring,
        };
        self.ledger
            .record_chunk(&record)
            .await
            .map_err(|source| ExecutorError::Ledger {
                step: self.ctx.step,
                range,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::backends::MemoryBackend;

    #[derive(Default)]
    struct RecordingOp {
        seen: Mutex<Vec<Vec<i64>>>,
        fail_on: Option<i64>,
        raise_after: Option<(i64, Arc<CoordinationFlags>)>,
    }

    #[async_trait]
    impl ChunkOperation<i64> for RecordingOp {
        async fn run_chunk(&self, items: &[i64]) -> Result<(), ChunkError> {
            if let Some(bad) = self.fail_on
                && items.contains(&bad)
            {
                return Err(ChunkError::Rejected(format!("item {bad}")));
            }
            self.seen.lock().expect("seen poisoned").push(items.to_vec());
            if let Some((trigger, flags)) = &self.raise_after
                && items.contains(trigger)
            {
                flags.raise_scale_out();
            }
            Ok(())
        }
    }

    fn executor(
        backend: &MemoryBackend,
        flags: &Arc<CoordinationFlags>,
        workers: usize,
        chunk_size: usize,
    ) -> ChunkedExecutor<MemoryBackend> {
        ChunkedExecutor::new(
            backend.clone(),
            Arc::clone(flags),
            ExecutorConfig {
                workers,
                chunk_size,
                chunk_timeout: Some(Duration::from_secs(5)),
            },
            MemberId::new(),
        )
    }

    fn ctx(execution_id: ExecutionId, restoring: bool) -> StepContext {
        StepContext {
            execution_id,
            step: StepType::Level,
            restoring,
        }
    }

    fn completed_starts(backend: &MemoryBackend) -> Vec<(i64, i64, bool)> {
        let mut rows: Vec<_> = backend
            .chunk_records()
            .into_iter()
            .map(|record| {
                (
                    record.range.start.primary,
                    record.range.end.primary,
                    record.completed,
                )
            })
            .collect();
        rows.sort();
        rows
    }

    #[tokio::test]
    async fn processes_every_chunk_and_records_the_ledger() {
        let backend = MemoryBackend::new();
        let flags = Arc::new(CoordinationFlags::new());
        let op = Arc::new(RecordingOp::default());
        let items: Vec<i64> = (1..=10).rev().collect();

        let summary = executor(&backend, &flags, 2, 3)
            .run(ctx(ExecutionId::new(), false), items, Arc::clone(&op))
            .await
            .expect("run");

        assert_eq!(summary.processed, 10);
        assert_eq!(summary.chunks, 4);
        assert_eq!(
            completed_starts(&backend),
            vec![(1, 3, true), (4, 5, true), (6, 8, true), (9, 10, true)]
        );
        let mut seen = op.seen.lock().expect("seen poisoned").clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![vec![1, 2, 3], vec![4, 5], vec![6, 7, 8], vec![9, 10]]
        );
    }

    #[tokio::test]
    async fn resume_only_processes_missing_ranges() {
        let backend = MemoryBackend::new();
        let flags = Arc::new(CoordinationFlags::new());
        let execution_id = ExecutionId::new();
        let items: Vec<i64> = (1..=9).collect();

        // First attempt: the latch is raised while the second chunk runs, so
        // the third chunk is recorded as not completed.
        let first = Arc::new(RecordingOp {
            raise_after: Some((4, Arc::clone(&flags))),
            ..RecordingOp::default()
        });
        let err = executor(&backend, &flags, 1, 3)
            .run(ctx(execution_id, false), items.clone(), first)
            .await
            .expect_err("interrupted");
        assert!(err.is_interrupted());
        assert_eq!(
            completed_starts(&backend),
            vec![(1, 3, true), (4, 6, true), (7, 9, false)]
        );

        flags.reset_scale_out();
        let second = Arc::new(RecordingOp::default());
        let summary = executor(&backend, &flags, 1, 3)
            .run(ctx(execution_id, true), items, Arc::clone(&second))
            .await
            .expect("resume");

        assert_eq!(summary.skipped, 6);
        assert_eq!(summary.processed, 3);
        assert_eq!(
            second.seen.lock().expect("seen poisoned").clone(),
            vec![vec![7, 8, 9]]
        );
        let records = backend.chunk_records();
        assert_eq!(records.len(), 3, "each range is recorded exactly once");
        assert!(records.iter().all(|record| record.completed));
        let resumed = records
            .iter()
            .find(|record| record.range.start.primary == 7)
            .expect("third range");
        assert!(resumed.restored);
    }

    #[tokio::test]
    async fn raised_latch_stops_before_the_next_chunk_runs() {
        let backend = MemoryBackend::new();
        let flags = Arc::new(CoordinationFlags::new());
        flags.raise_scale_out();
        let op = Arc::new(RecordingOp::default());

        let err = executor(&backend, &flags, 1, 5)
            .run(ctx(ExecutionId::new(), false), (1..=5).collect(), Arc::clone(&op))
            .await
            .expect_err("interrupted");

        assert!(matches!(err, ExecutorError::Interrupted { .. }));
        assert!(op.seen.lock().expect("seen poisoned").is_empty());
        assert_eq!(completed_starts(&backend), vec![(1, 5, false)]);
    }

    #[tokio::test]
    async fn chunk_failure_surfaces_as_stage_error() {
        let backend = MemoryBackend::new();
        let flags = Arc::new(CoordinationFlags::new());
        let op = Arc::new(RecordingOp {
            fail_on: Some(2),
            ..RecordingOp::default()
        });

        let err = executor(&backend, &flags, 1, 3)
            .run(ctx(ExecutionId::new(), false), (1..=6).collect(), op)
            .await
            .expect_err("chunk failure");

        match err {
            ExecutorError::ChunkFailed { range, source, .. } => {
                assert_eq!(range.start.primary, 1);
                assert!(matches!(source, ChunkError::Rejected(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(completed_starts(&backend), vec![(1, 3, false)]);
    }

    struct SlowOp;

    #[async_trait]
    impl ChunkOperation<i64> for SlowOp {
        async fn run_chunk(&self, _items: &[i64]) -> Result<(), ChunkError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_chunk_times_out() {
        let backend = MemoryBackend::new();
        let flags = Arc::new(CoordinationFlags::new());
        let executor = ChunkedExecutor::new(
            backend.clone(),
            flags,
            ExecutorConfig {
                workers: 1,
                chunk_size: 10,
                chunk_timeout: Some(Duration::from_millis(50)),
            },
            MemberId::new(),
        );

        let err = executor
            .run(ctx(ExecutionId::new(), false), vec![1, 2], Arc::new(SlowOp))
            .await
            .expect_err("timeout");

        assert!(matches!(
            err,
            ExecutorError::ChunkFailed {
                source: ChunkError::TimedOut(_),
                ..
            }
        ));
    }
}
