//! Periodic full-batch scheduler.

mod task;

pub use task::{CycleConfig, CycleOutcome, CycleTask, spawn_cycle_scheduler};
