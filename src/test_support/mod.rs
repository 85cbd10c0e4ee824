//! Test helpers shared across unit test modules.

mod fault_injection;
mod fixtures;

pub use fault_injection::FaultInjectingBackend;
pub use fixtures::{seed_members, seed_stale_badge, target_date};
