//! Heartbeat-based cluster membership and topology change detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::flags::CoordinationFlags;
use super::notify::ClusterSignals;
use crate::backends::{BackendResult, MembershipBackend};
use crate::models::{ClusterMember, MemberId, MemberRegistration};

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub heartbeat_interval: Duration,
    /// A member whose last heartbeat is older than this is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// This process's view of the membership table.
#[derive(Clone)]
pub struct MembershipRegistry<B> {
    backend: B,
    member_id: MemberId,
    config: MembershipConfig,
}

impl<B: MembershipBackend + Clone + 'static> MembershipRegistry<B> {
    pub fn new(backend: B, member_id: MemberId, config: MembershipConfig) -> Self {
        Self {
            backend,
            member_id,
            config,
        }
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Heartbeats at or before this instant no longer count as alive.
    pub fn alive_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = ChronoDuration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        now - timeout
    }

    pub async fn register(
        &self,
        process_index: i32,
        address: impl Into<String>,
    ) -> BackendResult<ClusterMember> {
        let registration = MemberRegistration {
            member_id: self.member_id,
            process_index,
            address: address.into(),
        };
        let member = self
            .backend
            .register_member(&registration, Utc::now())
            .await?;
        info!(
            member_id = %member.member_id,
            process_index = member.process_index,
            address = %member.address,
            "registered cluster member"
        );
        Ok(member)
    }

    pub async fn heartbeat(&self) -> BackendResult<()> {
        self.backend.heartbeat_member(self.member_id, Utc::now()).await
    }

    pub async fn alive_members(&self) -> BackendResult<Vec<ClusterMember>> {
        self.backend
            .list_alive_members(self.alive_since(Utc::now()))
            .await
    }

    pub async fn alive_count(&self) -> BackendResult<usize> {
        Ok(self.alive_members().await?.len())
    }
}

/// Change in the number of alive members between two observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyChange {
    pub previous: usize,
    pub current: usize,
}

/// Tracks the alive count across heartbeat ticks.
#[derive(Debug, Default)]
pub struct ScaleOutDetector {
    last_count: Option<usize>,
}

impl ScaleOutDetector {
    /// Record `count` and report a change against the previous observation.
    /// The first observation never reports a change.
    pub fn observe(&mut self, count: usize) -> Option<TopologyChange> {
        let previous = self.last_count.replace(count)?;
        (previous != count).then_some(TopologyChange {
            previous,
            current: count,
        })
    }
}

/// Refresh this member's heartbeat on an interval and interrupt the running
/// batch when the cluster topology changes.
pub fn spawn_membership_heartbeat<B>(
    registry: MembershipRegistry<B>,
    signals: ClusterSignals<B>,
    flags: Arc<CoordinationFlags>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    B: MembershipBackend + Clone + 'static,
{
    tokio::spawn(async move {
        let mut detector = ScaleOutDetector::default();
        let interval = registry.config().heartbeat_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("membership heartbeat shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(err) = registry.heartbeat().await {
                warn!(error = %err, "failed to refresh membership heartbeat");
                continue;
            }
            let alive = match registry.alive_count().await {
                Ok(count) => count,
                Err(err) => {
                    warn!(error = %err, "failed to count alive members");
                    continue;
                }
            };
            debug!(alive, "membership heartbeat tick");

            let Some(change) = detector.observe(alive) else {
                continue;
            };
            info!(
                previous = change.previous,
                current = change.current,
                "cluster topology changed"
            );
            if !flags.is_global_gate_raised() {
                continue;
            }
            match signals.broadcast_interrupt().await {
                Ok(notified) => {
                    info!(notified, "broadcast scale-out interrupt");
                }
                Err(err) => {
                    warn!(error = %err, "scale-out interrupt broadcast failed");
                }
            }
        }
    })
}
