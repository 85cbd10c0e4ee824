//! Background cycle scheduler.
//!
//! This task periodically triggers a full batch for today's date. Outcomes
//! are only logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::backends::BatchBackend;
use crate::orchestrator::{BatchError, BatchService};

/// Configuration for the cycle scheduler.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// How often to trigger a full batch.
    pub interval: Duration,
    pub batch_size: Option<usize>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            batch_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    AlreadyCompleted,
    Owner,
    NotOwner,
}

/// Background cycle scheduler task.
pub struct CycleTask<B: BatchBackend> {
    backend: B,
    service: Arc<BatchService<B>>,
    config: CycleConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: BatchBackend> CycleTask<B> {
    pub fn new(
        backend: B,
        service: Arc<BatchService<B>>,
        config: CycleConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            service,
            config,
            shutdown_rx,
        }
    }

    /// Run the scheduler loop.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis(),
            "cycle scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("cycle scheduler shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    let today = Utc::now().date_naive();
                    match self.tick(today).await {
                        Ok(outcome) => info!(target_date = %today, ?outcome, "cycle tick finished"),
                        Err(err) => error!(target_date = %today, error = %err, "cycle batch failed"),
                    }
                }
            }
        }
    }

    pub async fn tick(&self, target_date: NaiveDate) -> Result<CycleOutcome, BatchError> {
        let completed = self
            .backend
            .has_completed_execution(target_date)
            .await
            .map_err(|source| BatchError::Claim {
                target_date,
                source,
            })?;
        if completed {
            debug!(target_date = %target_date, "batch already completed for date");
            return Ok(CycleOutcome::AlreadyCompleted);
        }

        let owner = self
            .service
            .run_full_batch(target_date, self.config.batch_size)
            .await?;
        Ok(if owner {
            CycleOutcome::Owner
        } else {
            CycleOutcome::NotOwner
        })
    }
}

/// Convenience function to spawn the cycle scheduler.
pub fn spawn_cycle_scheduler<B: BatchBackend>(
    backend: B,
    service: Arc<BatchService<B>>,
    config: CycleConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = CycleTask::new(backend, service, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::cluster::CoordinationFlags;
    use crate::domain::ThresholdRules;
    use crate::models::{BatchStatus, MemberId};
    use crate::orchestrator::{BatchOrchestrator, OrchestratorConfig};
    use crate::test_support::{seed_members, target_date};

    fn task(backend: &MemoryBackend, flags: Arc<CoordinationFlags>) -> CycleTask<MemoryBackend> {
        let orchestrator = Arc::new(BatchOrchestrator::new(
            backend.clone(),
            Arc::new(ThresholdRules::default()),
            Arc::clone(&flags),
            OrchestratorConfig::default(),
            MemberId::new(),
        ));
        let service = Arc::new(BatchService::new(orchestrator, flags, None));
        // The receiver outlives the dropped sender; `tick` never reads it.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        CycleTask::new(backend.clone(), service, CycleConfig::default(), shutdown_rx)
    }

    #[tokio::test]
    async fn runs_once_then_skips_completed_date() {
        let backend = MemoryBackend::new();
        seed_members(&backend, 4);
        let task = task(&backend, Arc::new(CoordinationFlags::new()));

        assert_eq!(task.tick(target_date()).await.expect("tick"), CycleOutcome::Owner);
        assert_eq!(
            task.tick(target_date()).await.expect("tick"),
            CycleOutcome::AlreadyCompleted
        );
        let executions = backend.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn busy_process_is_not_owner() {
        let backend = MemoryBackend::new();
        seed_members(&backend, 4);
        let flags = Arc::new(CoordinationFlags::new());
        flags.raise_global_gate();
        let task = task(&backend, Arc::clone(&flags));

        assert_eq!(
            task.tick(target_date()).await.expect("tick"),
            CycleOutcome::NotOwner
        );
        assert!(backend.executions().is_empty());
    }
}
