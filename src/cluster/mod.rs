//! Cluster coordination: process-local flags, heartbeat membership, peer
//! signals and the member HTTP endpoint.

mod flags;
mod membership;
mod notify;
mod server;

pub use flags::{CoordinationFlags, GlobalGateGuard, InFlightLeases, LeaseSet};
pub use membership::{
    MembershipConfig, MembershipRegistry, ScaleOutDetector, TopologyChange,
    spawn_membership_heartbeat,
};
pub use notify::{
    ClusterSignal, ClusterSignals, HttpPeerNotifier, NotifyError, PeerNotifier, SignalAck,
    SignalRequest, receive_signal,
};
pub use server::{
    BatchTrigger, ClusterServer, ErrorResponseBody, HealthResponse, InFlightResponse,
    RunBatchRequest, RunBatchResponse,
};
