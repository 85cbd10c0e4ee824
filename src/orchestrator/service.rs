//! Process-level entry point around the orchestrator: holds the global gate
//! for the duration of a run and cleans up cluster flags after a scale-out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{info, warn};

use super::{BatchError, BatchOrchestrator, RunReport};
use crate::backends::BatchBackend;
use crate::cluster::{BatchTrigger, ClusterSignals, CoordinationFlags, GlobalGateGuard};
use crate::models::BatchExecution;

pub struct BatchService<B: BatchBackend> {
    orchestrator: Arc<BatchOrchestrator<B>>,
    flags: Arc<CoordinationFlags>,
    /// `None` for single-process runs that have no peers to notify.
    signals: Option<ClusterSignals<B>>,
}

impl<B: BatchBackend> BatchService<B> {
    pub fn new(
        orchestrator: Arc<BatchOrchestrator<B>>,
        flags: Arc<CoordinationFlags>,
        signals: Option<ClusterSignals<B>>,
    ) -> Self {
        Self {
            orchestrator,
            flags,
            signals,
        }
    }

    pub fn orchestrator(&self) -> &Arc<BatchOrchestrator<B>> {
        &self.orchestrator
    }

    pub fn flags(&self) -> &Arc<CoordinationFlags> {
        &self.flags
    }

    /// Take the global gate, or `None` when this process is already running
    /// a batch.
    pub fn try_lock_gate(&self) -> Option<GlobalGateGuard> {
        GlobalGateGuard::try_acquire(&self.flags)
    }

    /// Run `target_date` unless this process or another member already
    /// owns it.
    pub async fn run_full_batch(
        &self,
        target_date: NaiveDate,
        batch_size: Option<usize>,
    ) -> Result<bool, BatchError> {
        let Some(_gate) = self.try_lock_gate() else {
            info!(target_date = %target_date, "batch already running in this process");
            return Ok(false);
        };
        self.flags.reset_scale_out();
        let outcome = self
            .orchestrator
            .run_full_batch(target_date, batch_size)
            .await;
        self.after_run(outcome).await
    }

    /// Resume an execution whose restore the caller has acquired while
    /// holding `gate`.
    pub async fn resume(
        &self,
        _gate: &GlobalGateGuard,
        execution: &BatchExecution,
        batch_size: Option<usize>,
    ) -> Result<RunReport, BatchError> {
        self.flags.reset_scale_out();
        let outcome = self.orchestrator.resume(execution, batch_size).await;
        self.after_run(outcome).await
    }

    /// After a scale-out the local latch is reset and peers are told to
    /// resume. A failed broadcast replaces the original error.
    async fn after_run<T>(&self, outcome: Result<T, BatchError>) -> Result<T, BatchError> {
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_scale_out() => err,
            Err(err) => return Err(err),
        };

        let Some(signals) = &self.signals else {
            self.flags.reset_scale_out();
            return Err(err);
        };
        match signals.broadcast_resume().await {
            Ok(notified) => {
                info!(notified, error = %err, "broadcast resume after scale-out");
                Err(err)
            }
            Err(notify_err) => {
                self.flags.reset_scale_out();
                warn!(
                    error = %err,
                    notify_error = %notify_err,
                    "resume broadcast failed after scale-out"
                );
                Err(BatchError::Notification(notify_err))
            }
        }
    }
}

#[async_trait]
impl<B: BatchBackend> BatchTrigger for BatchService<B> {
    async fn trigger(
        &self,
        target_date: NaiveDate,
        batch_size: Option<usize>,
    ) -> Result<bool, BatchError> {
        self.run_full_batch(target_date, batch_size).await
    }
}
