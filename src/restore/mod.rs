//! Restore trigger for interrupted batch runs.

mod task;

pub use task::{RestoreConfig, RestoreOutcome, RestoreTask, spawn_restore_trigger};
