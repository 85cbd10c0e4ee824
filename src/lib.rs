//! Tierbatch - crash-recoverable batch engine for badge, tier and coupon
//! recomputation across a cluster of processes.

pub mod backends;
pub mod cluster;
pub mod config;
pub mod db;
pub mod domain;
pub mod executor;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod restore;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use backends::{BackendError, BackendResult, BatchBackend, MemoryBackend, PostgresBackend};
pub use cluster::{
    ClusterServer, ClusterSignals, CoordinationFlags, HttpPeerNotifier, MembershipRegistry,
    spawn_membership_heartbeat,
};
pub use config::Config;
pub use domain::{BatchRules, ThresholdRules};
pub use executor::{ChunkedExecutor, ExecutorConfig};
pub use observability::obs;
pub use orchestrator::{BatchError, BatchOrchestrator, BatchService, OrchestratorConfig};
pub use restore::{RestoreConfig, spawn_restore_trigger};
pub use scheduler::{CycleConfig, spawn_cycle_scheduler};
