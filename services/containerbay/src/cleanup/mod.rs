//! Periodic reclamation of unused cache entries.

mod worker;

pub use worker::{next_delay, CleanupConfig, CleanupWorker};
