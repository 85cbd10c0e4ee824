//! Point-to-point signals that mirror coordination flags across members.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::flags::CoordinationFlags;
use super::membership::MembershipRegistry;
use crate::backends::{BackendError, MembershipBackend};
use crate::models::{ClusterMember, MemberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSignal {
    /// Raise the scale-out latch if a batch is running.
    Interrupt,
    /// Clear the scale-out latch.
    Resume,
}

impl ClusterSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Resume => "resume",
        }
    }
}

impl std::fmt::Display for ClusterSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signal: ClusterSignal,
    pub origin: MemberId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalAck {
    pub acknowledged: bool,
    pub member_id: MemberId,
    /// Whether the receiver raised its latch for this signal.
    pub interrupted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to reach member {member_id} at {address}: {source}")]
    Transport {
        member_id: MemberId,
        address: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("member {member_id} rejected {signal} with status {status}")]
    Rejected {
        member_id: MemberId,
        signal: ClusterSignal,
        status: u16,
    },
    #[error("member {member_id} did not acknowledge {signal}")]
    Nack {
        member_id: MemberId,
        signal: ClusterSignal,
    },
    #[error("failed to list cluster members: {0}")]
    Membership(#[from] BackendError),
}

/// Apply an inbound signal to this process's flags.
pub fn receive_signal(
    flags: &CoordinationFlags,
    member_id: MemberId,
    request: &SignalRequest,
) -> SignalAck {
    let interrupted = match request.signal {
        ClusterSignal::Interrupt => {
            let running = flags.is_global_gate_raised();
            if running {
                flags.raise_scale_out();
            }
            running
        }
        ClusterSignal::Resume => {
            flags.reset_scale_out();
            false
        }
    };
    info!(
        signal = %request.signal,
        origin = %request.origin,
        interrupted,
        "received cluster signal"
    );
    SignalAck {
        acknowledged: true,
        member_id,
        interrupted,
    }
}

/// Delivers a signal to one peer.
#[async_trait]
pub trait PeerNotifier: Send + Sync + 'static {
    async fn notify(
        &self,
        member: &ClusterMember,
        request: &SignalRequest,
    ) -> Result<SignalAck, NotifyError>;
}

/// Posts signals to each peer's `/cluster/signal` endpoint.
#[derive(Clone)]
pub struct HttpPeerNotifier {
    client: reqwest::Client,
}

impl HttpPeerNotifier {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerNotifier for HttpPeerNotifier {
    async fn notify(
        &self,
        member: &ClusterMember,
        request: &SignalRequest,
    ) -> Result<SignalAck, NotifyError> {
        let transport = |source| NotifyError::Transport {
            member_id: member.member_id,
            address: member.address.clone(),
            source,
        };
        let url = format!("http://{}/cluster/signal", member.address);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                member_id: member.member_id,
                signal: request.signal,
                status: status.as_u16(),
            });
        }
        let ack: SignalAck = response.json().await.map_err(transport)?;
        if !ack.acknowledged {
            return Err(NotifyError::Nack {
                member_id: member.member_id,
                signal: request.signal,
            });
        }
        Ok(ack)
    }
}

/// Cluster-wide flag changes: update the local flags, then every alive peer.
#[derive(Clone)]
pub struct ClusterSignals<B> {
    registry: MembershipRegistry<B>,
    notifier: Arc<dyn PeerNotifier>,
    flags: Arc<CoordinationFlags>,
}

impl<B: MembershipBackend + Clone + 'static> ClusterSignals<B> {
    pub fn new(
        registry: MembershipRegistry<B>,
        notifier: Arc<dyn PeerNotifier>,
        flags: Arc<CoordinationFlags>,
    ) -> Self {
        Self {
            registry,
            notifier,
            flags,
        }
    }

    /// Raise the local latch and interrupt every alive peer.
    pub async fn broadcast_interrupt(&self) -> Result<usize, NotifyError> {
        self.flags.raise_scale_out();
        self.broadcast(ClusterSignal::Interrupt).await
    }

    /// Reset the local latch and tell every alive peer to do the same.
    pub async fn broadcast_resume(&self) -> Result<usize, NotifyError> {
        self.flags.reset_scale_out();
        self.broadcast(ClusterSignal::Resume).await
    }

    /// Tell running peers that this member joined. The local latch is left
    /// untouched.
    pub async fn announce_join(&self) -> Result<usize, NotifyError> {
        self.broadcast(ClusterSignal::Interrupt).await
    }

    /// Deliver `signal` to every alive peer. The first failure aborts the
    /// broadcast.
    pub async fn broadcast(&self, signal: ClusterSignal) -> Result<usize, NotifyError> {
        let request = SignalRequest {
            signal,
            origin: self.registry.member_id(),
        };
        let peers: Vec<ClusterMember> = self
            .registry
            .alive_members()
            .await?
            .into_iter()
            .filter(|member| member.member_id != self.registry.member_id())
            .collect();

        for peer in &peers {
            let ack = self.notifier.notify(peer, &request).await?;
            debug!(
                signal = %signal,
                member_id = %peer.member_id,
                interrupted = ack.interrupted,
                "peer acknowledged signal"
            );
        }
        Ok(peers.len())
    }
}
