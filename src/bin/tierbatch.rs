//! Tierbatch - runs the batch engine as a cluster member or as a one-shot.
//!
//! `tierbatch serve` starts everything a cluster member needs:
//! - Connects to the database and applies migrations
//! - Registers in the membership table and heartbeats
//! - Serves the cluster HTTP endpoint (peer signals, manual trigger)
//! - Runs the restore trigger and, if enabled, the periodic cycle scheduler
//!
//! `tierbatch run --date YYYY-MM-DD` claims and runs one date in-process,
//! registered and heartbeating as a member until the run ends.
//!
//! Configuration is via `TIERBATCH_*` environment variables (see `config`).

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tierbatch::observability::init_tracing;
use tierbatch::{
    BatchOrchestrator, BatchService, ClusterServer, ClusterSignals, Config, CoordinationFlags,
    HttpPeerNotifier, MembershipRegistry, PostgresBackend, spawn_cycle_scheduler,
    spawn_membership_heartbeat, spawn_restore_trigger,
};
use tierbatch::models::MemberId;

#[derive(Parser, Debug)]
#[command(name = "tierbatch", about = "Badge, tier and coupon batch engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the cluster and run background tasks until shutdown.
    Serve,
    /// Run the batch for one date and exit.
    Run {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("tierbatch=info");
    let args = Args::parse();
    let config = Config::from_env()?;

    let backend = PostgresBackend::connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    match args.command {
        Command::Serve => serve(config, backend).await,
        Command::Run { date, batch_size } => run_once(config, backend, date, batch_size).await,
    }
}

/// A one-shot run joins the cluster for its duration so restore on other
/// members sees a live owner and peers can interrupt it on scale-out.
async fn run_once(
    config: Config,
    backend: PostgresBackend,
    date: NaiveDate,
    batch_size: Option<usize>,
) -> Result<()> {
    let member_id = MemberId::new();
    let flags = Arc::new(CoordinationFlags::new());

    let registry = MembershipRegistry::new(backend.clone(), member_id, config.membership());
    let notifier =
        HttpPeerNotifier::new(config.notify_timeout).context("failed to build peer notifier")?;
    let signals = ClusterSignals::new(registry.clone(), Arc::new(notifier), Arc::clone(&flags));

    let orchestrator = Arc::new(BatchOrchestrator::new(
        backend,
        Arc::new(config.rules.clone()),
        Arc::clone(&flags),
        config.orchestrator(),
        member_id,
    ));
    let service = Arc::new(BatchService::new(
        orchestrator,
        Arc::clone(&flags),
        Some(signals.clone()),
    ));

    let server = ClusterServer::start(
        &config.one_shot_listen_addr().to_string(),
        member_id,
        Arc::clone(&flags),
        service.clone(),
    )
    .await?;
    registry
        .register(config.process_index, config.advertise_with_port(server.addr().port()))
        .await
        .context("failed to register cluster member")?;

    let heartbeat_shutdown = CancellationToken::new();
    let heartbeat = spawn_membership_heartbeat(
        registry,
        signals,
        Arc::clone(&flags),
        heartbeat_shutdown.clone(),
    );
    info!(member_id = %member_id, addr = %server.addr(), target_date = %date, "running one-shot batch");

    let outcome = service.run_full_batch(date, batch_size).await;

    heartbeat_shutdown.cancel();
    let _ = heartbeat.await;
    server.shutdown().await;

    if outcome? {
        info!(target_date = %date, "batch completed");
    } else {
        warn!(target_date = %date, "batch for date is already owned by another run");
    }
    Ok(())
}

async fn serve(config: Config, backend: PostgresBackend) -> Result<()> {
    let member_id = MemberId::new();
    let flags = Arc::new(CoordinationFlags::new());

    let registry = MembershipRegistry::new(backend.clone(), member_id, config.membership());
    registry
        .register(config.process_index, config.advertise_addr.clone())
        .await
        .context("failed to register cluster member")?;

    let notifier =
        HttpPeerNotifier::new(config.notify_timeout).context("failed to build peer notifier")?;
    let signals = ClusterSignals::new(registry.clone(), Arc::new(notifier), Arc::clone(&flags));

    let orchestrator = Arc::new(BatchOrchestrator::new(
        backend.clone(),
        Arc::new(config.rules.clone()),
        Arc::clone(&flags),
        config.orchestrator(),
        member_id,
    ));
    let service = Arc::new(BatchService::new(
        orchestrator,
        Arc::clone(&flags),
        Some(signals.clone()),
    ));

    let server = ClusterServer::start(
        &config.listen_addr.to_string(),
        member_id,
        Arc::clone(&flags),
        service.clone(),
    )
    .await?;

    // Running peers treat a new member as a topology change.
    match signals.announce_join().await {
        Ok(notified) => info!(notified, "announced join to peers"),
        Err(err) => warn!(error = %err, "failed to announce join"),
    }

    let heartbeat_shutdown = CancellationToken::new();
    let heartbeat = spawn_membership_heartbeat(
        registry.clone(),
        signals,
        Arc::clone(&flags),
        heartbeat_shutdown.clone(),
    );
    let (restore_handle, restore_shutdown) = spawn_restore_trigger(
        backend.clone(),
        Arc::clone(&service),
        registry,
        config.restore(),
    );
    let cycle = config
        .cycle_enabled
        .then(|| spawn_cycle_scheduler(backend, Arc::clone(&service), config.cycle()));

    info!(
        member_id = %member_id,
        addr = %server.addr(),
        workers = config.worker_count,
        chunk_size = config.chunk_size,
        "tierbatch member started - waiting for shutdown signal"
    );

    wait_for_shutdown().await?;
    info!("shutdown signal received");

    let _ = restore_shutdown.send(true);
    if let Some((_, cycle_shutdown)) = &cycle {
        let _ = cycle_shutdown.send(true);
    }
    heartbeat_shutdown.cancel();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), restore_handle).await;
    if let Some((cycle_handle, _)) = cycle {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), cycle_handle).await;
    }
    let _ = heartbeat.await;
    server.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
