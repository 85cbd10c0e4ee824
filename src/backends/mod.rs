//! Backend implementations for batch persistence.

mod base;
mod memory;
mod postgres;

pub use base::{
    BackendError, BackendResult, BatchBackend, ChunkLedgerBackend, EntitlementBackend,
    ExecutionLogBackend, MembershipBackend, SnapshotBackend, SubjectSource,
};
pub use memory::{BadgeChangeLog, MemoryBackend, TierChangeLog};
pub use postgres::PostgresBackend;
