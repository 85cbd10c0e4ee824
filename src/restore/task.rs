//! Background restore trigger.
//!
//! Each tick looks for an interrupted run of today's date that no alive
//! member owns, and resumes at most one of them on this process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backends::{BackendError, BackendResult, BatchBackend};
use crate::cluster::MembershipRegistry;
use crate::models::{BatchExecution, ExecutionId, InterruptCause, MemberId};
use crate::orchestrator::BatchService;

/// Configuration for the restore trigger.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// How often to look for restorable runs.
    pub interval: Duration,
    /// Batch size passed to resumed runs; `None` uses the orchestrator default.
    pub batch_size: Option<usize>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_size: None,
        }
    }
}

/// Result of one restore tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// An alive member still owns an active run for the date.
    OwnerAlive { owners: usize },
    /// This process is already running a batch.
    GateBusy,
    NothingToRestore,
    /// Every candidate was taken by another member first.
    Contended,
    Resumed { execution_id: ExecutionId },
    /// The resumed run was interrupted again.
    ResumeFailed { execution_id: ExecutionId },
}

/// Background restore trigger task.
pub struct RestoreTask<B: BatchBackend> {
    backend: B,
    service: Arc<BatchService<B>>,
    registry: MembershipRegistry<B>,
    config: RestoreConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: BatchBackend> RestoreTask<B> {
    pub fn new(
        backend: B,
        service: Arc<BatchService<B>>,
        registry: MembershipRegistry<B>,
        config: RestoreConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            service,
            registry,
            config,
            shutdown_rx,
        }
    }

    /// Run the restore loop.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis(),
            "restore trigger started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("restore trigger shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    let today = Utc::now().date_naive();
                    match self.tick(today).await {
                        Ok(outcome) => debug!(target_date = %today, ?outcome, "restore tick finished"),
                        Err(err) => error!(target_date = %today, error = %err, "restore tick failed"),
                    }
                }
            }
        }
    }

    /// Check `target_date` once and resume at most one interrupted run.
    pub async fn tick(&self, target_date: NaiveDate) -> BackendResult<RestoreOutcome> {
        let now = Utc::now();
        let alive_since = self.registry.alive_since(now);

        let orphaned = self
            .backend
            .interrupt_orphaned_executions(target_date, alive_since, now)
            .await?;
        if orphaned > 0 {
            warn!(target_date = %target_date, orphaned, "interrupted runs whose owner is gone");
        }

        let Some(gate) = self.service.try_lock_gate() else {
            return Ok(RestoreOutcome::GateBusy);
        };
        let owner = self.service.orchestrator().member_id();
        self.release_stranded(target_date, owner).await?;

        let owners = self
            .backend
            .count_alive_active_owners(target_date, alive_since)
            .await?;
        if owners > 0 {
            return Ok(RestoreOutcome::OwnerAlive { owners });
        }

        let candidates = self
            .backend
            .list_restorable_executions(target_date)
            .await?;
        if candidates.is_empty() {
            return Ok(RestoreOutcome::NothingToRestore);
        }

        for candidate in candidates {
            let execution_id = candidate.execution_id;
            if !self
                .backend
                .acquire_restore(execution_id, owner, Utc::now())
                .await?
            {
                debug!(execution_id = %execution_id, "restore already taken");
                continue;
            }

            let execution = match self.load_acquired(execution_id).await {
                Ok(execution) => execution,
                Err(err) => {
                    self.release(execution_id, owner).await;
                    return Err(err);
                }
            };
            info!(
                execution_id = %execution_id,
                target_date = %target_date,
                "restoring interrupted execution"
            );
            return match self
                .service
                .resume(&gate, &execution, self.config.batch_size)
                .await
            {
                Ok(_) => Ok(RestoreOutcome::Resumed { execution_id }),
                Err(err) => {
                    error!(execution_id = %execution_id, error = %err, "restore attempt failed");
                    Ok(RestoreOutcome::ResumeFailed { execution_id })
                }
            };
        }
        Ok(RestoreOutcome::Contended)
    }

    /// With the gate held nothing runs locally, so an active run still owned
    /// by this member was left behind by a failed interrupt write.
    async fn release_stranded(&self, target_date: NaiveDate, owner: MemberId) -> BackendResult<()> {
        let stranded = self
            .backend
            .list_executions(target_date)
            .await?
            .into_iter()
            .filter(|execution| {
                execution.status.is_active() && execution.owner_member_id == Some(owner)
            });
        for execution in stranded {
            warn!(
                execution_id = %execution.execution_id,
                status = %execution.status,
                "releasing run stranded under this member"
            );
            self.backend
                .mark_interrupted(execution.execution_id, owner, InterruptCause::Failure, Utc::now())
                .await?;
        }
        Ok(())
    }

    async fn load_acquired(&self, execution_id: ExecutionId) -> BackendResult<BatchExecution> {
        self.backend
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| {
                BackendError::Message(format!("execution {execution_id} vanished during restore"))
            })
    }

    /// Hand an acquired restore back so the next tick can retry it.
    async fn release(&self, execution_id: ExecutionId, owner: MemberId) {
        match self
            .backend
            .mark_interrupted(execution_id, owner, InterruptCause::Failure, Utc::now())
            .await
        {
            Ok(_) => warn!(execution_id = %execution_id, "released restore after a failed handoff"),
            Err(err) => error!(
                execution_id = %execution_id,
                error = %err,
                "failed to release restore, the next tick sweeps it"
            ),
        }
    }
}

/// Convenience function to spawn the restore trigger.
pub fn spawn_restore_trigger<B: BatchBackend>(
    backend: B,
    service: Arc<BatchService<B>>,
    registry: MembershipRegistry<B>,
    config: RestoreConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = RestoreTask::new(backend, service, registry, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::backends::{ExecutionLogBackend, MemoryBackend};
    use crate::cluster::{CoordinationFlags, MembershipConfig};
    use crate::domain::ThresholdRules;
    use crate::models::{BatchStatus, ExecutionClaim, InterruptCause, MemberId};
    use crate::orchestrator::{BatchOrchestrator, OrchestratorConfig};
    use crate::test_support::{FaultInjectingBackend, seed_members, target_date};

    struct Harness<B: BatchBackend> {
        backend: B,
        registry: MembershipRegistry<B>,
        task: RestoreTask<B>,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn harness() -> Harness<MemoryBackend> {
        let backend = MemoryBackend::new();
        seed_members(&backend, 5);
        harness_on(backend).await
    }

    async fn faulty_harness() -> Harness<FaultInjectingBackend> {
        let memory = MemoryBackend::new();
        seed_members(&memory, 5);
        harness_on(FaultInjectingBackend::new(memory)).await
    }

    async fn harness_on<B: BatchBackend>(backend: B) -> Harness<B> {
        let flags = Arc::new(CoordinationFlags::new());
        let member_id = MemberId::new();
        let registry =
            MembershipRegistry::new(backend.clone(), member_id, MembershipConfig::default());
        registry.register(0, "127.0.0.1:24210").await.expect("register");

        let orchestrator = Arc::new(BatchOrchestrator::new(
            backend.clone(),
            Arc::new(ThresholdRules::default()),
            Arc::clone(&flags),
            OrchestratorConfig::default(),
            member_id,
        ));
        let service = Arc::new(BatchService::new(orchestrator, flags, None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = RestoreTask::new(
            backend.clone(),
            service,
            registry.clone(),
            RestoreConfig::default(),
            shutdown_rx,
        );
        Harness {
            backend,
            registry,
            task,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn claim<B: BatchBackend>(backend: &B, owner: MemberId) -> ExecutionId {
        let now = Utc::now();
        backend
            .claim_execution(&ExecutionClaim {
                execution_id: ExecutionId::new(),
                target_date: target_date(),
                cutoff_at: now,
                owner,
                started_at: now,
            })
            .await
            .expect("claim")
            .expect("claimed")
            .execution_id
    }

    async fn interrupted<B: BatchBackend>(backend: &B, owner: MemberId) -> ExecutionId {
        let execution_id = claim(backend, owner).await;
        backend
            .mark_interrupted(execution_id, owner, InterruptCause::Failure, Utc::now())
            .await
            .expect("interrupt");
        execution_id
    }

    async fn status<B: BatchBackend>(backend: &B, execution_id: ExecutionId) -> BatchStatus {
        backend
            .get_execution(execution_id)
            .await
            .expect("get")
            .expect("exists")
            .status
    }

    #[tokio::test]
    async fn resumes_interrupted_run_without_alive_owner() {
        let harness = harness().await;
        let execution_id = interrupted(&harness.backend, MemberId::new()).await;

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        assert_eq!(outcome, RestoreOutcome::Resumed { execution_id });
        assert_eq!(status(&harness.backend, execution_id).await, BatchStatus::Completed);
        let execution = harness
            .backend
            .get_execution(execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.owner_member_id, Some(harness.registry.member_id()));
        assert!(execution.restored_at.is_some());
    }

    #[tokio::test]
    async fn alive_owner_blocks_restore() {
        let harness = harness().await;
        let peer = MembershipRegistry::new(
            harness.backend.clone(),
            MemberId::new(),
            MembershipConfig::default(),
        );
        peer.register(1, "127.0.0.1:24211").await.expect("register peer");
        interrupted(&harness.backend, MemberId::new()).await;
        claim(&harness.backend, peer.member_id()).await;

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        assert_eq!(outcome, RestoreOutcome::OwnerAlive { owners: 1 });
    }

    #[tokio::test]
    async fn orphaned_run_is_interrupted_then_restored() {
        let harness = harness().await;
        let dead = MembershipRegistry::new(
            harness.backend.clone(),
            MemberId::new(),
            MembershipConfig::default(),
        );
        dead.register(1, "127.0.0.1:24211").await.expect("register");
        let execution_id = claim(&harness.backend, dead.member_id()).await;
        harness
            .backend
            .set_member_heartbeat(dead.member_id(), Utc::now() - ChronoDuration::minutes(5));

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        assert_eq!(outcome, RestoreOutcome::Resumed { execution_id });
        let execution = harness
            .backend
            .get_execution(execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.interrupt_cause, Some(InterruptCause::OwnerLost));
    }

    #[tokio::test]
    async fn superseded_runs_are_left_alone() {
        let harness = harness().await;
        let stale = interrupted(&harness.backend, MemberId::new()).await;
        let done_owner = MemberId::new();
        let done = claim(&harness.backend, done_owner).await;
        harness
            .backend
            .mark_completed(done, done_owner, Utc::now())
            .await
            .expect("complete");

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        assert_eq!(outcome, RestoreOutcome::NothingToRestore);
        assert_eq!(status(&harness.backend, stale).await, BatchStatus::Interrupted);
    }

    #[tokio::test]
    async fn busy_gate_defers_restore() {
        let harness = harness().await;
        let execution_id = interrupted(&harness.backend, MemberId::new()).await;
        let _gate = harness.task.service.try_lock_gate().expect("gate");

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        assert_eq!(outcome, RestoreOutcome::GateBusy);
        assert_eq!(status(&harness.backend, execution_id).await, BatchStatus::Interrupted);
    }

    #[tokio::test]
    async fn restores_at_most_one_run_per_tick() {
        let harness = harness().await;
        let first = interrupted(&harness.backend, MemberId::new()).await;
        let second = interrupted(&harness.backend, MemberId::new()).await;

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        let RestoreOutcome::Resumed { execution_id } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        let other = if execution_id == first { second } else { first };
        assert_eq!(status(&harness.backend, execution_id).await, BatchStatus::Completed);
        assert_eq!(status(&harness.backend, other).await, BatchStatus::Interrupted);
        // The completed run supersedes the remaining one.
        assert_eq!(
            harness.task.tick(target_date()).await.expect("tick"),
            RestoreOutcome::NothingToRestore
        );
    }

    #[tokio::test]
    async fn registered_one_shot_owner_keeps_its_run() {
        let harness = harness().await;
        let one_shot = MembershipRegistry::new(
            harness.backend.clone(),
            MemberId::new(),
            MembershipConfig::default(),
        );
        one_shot.register(2, "127.0.0.1:24212").await.expect("register one-shot");
        let execution_id = claim(&harness.backend, one_shot.member_id()).await;

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        assert_eq!(outcome, RestoreOutcome::OwnerAlive { owners: 1 });
        let execution = harness
            .backend
            .get_execution(execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.status, BatchStatus::Running);
        assert_eq!(execution.owner_member_id, Some(one_shot.member_id()));
    }

    #[tokio::test]
    async fn failed_handoff_releases_the_acquired_restore() {
        let harness = faulty_harness().await;
        let execution_id = interrupted(&harness.backend, MemberId::new()).await;
        harness.backend.fail_next_get_execution();

        harness
            .task
            .tick(target_date())
            .await
            .expect_err("read failure after acquire");

        let released = harness
            .backend
            .inner()
            .get_execution(execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(released.status, BatchStatus::Interrupted);
        assert_eq!(released.owner_member_id, Some(harness.registry.member_id()));

        let outcome = harness.task.tick(target_date()).await.expect("tick");
        assert_eq!(outcome, RestoreOutcome::Resumed { execution_id });
        assert_eq!(status(&harness.backend, execution_id).await, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn run_stranded_under_this_member_is_released_and_restored() {
        let harness = faulty_harness().await;
        harness.backend.fail_next_badge_apply();
        harness.backend.fail_mark_interrupted(3);

        harness
            .task
            .service
            .run_full_batch(target_date(), None)
            .await
            .expect_err("apply failure");
        let stranded = harness.backend.inner().executions();
        assert_eq!(stranded.len(), 1);
        let execution_id = stranded[0].execution_id;
        assert_eq!(stranded[0].status, BatchStatus::Running);

        let outcome = harness.task.tick(target_date()).await.expect("tick");

        assert_eq!(outcome, RestoreOutcome::Resumed { execution_id });
        assert_eq!(status(&harness.backend, execution_id).await, BatchStatus::Completed);
    }
}
