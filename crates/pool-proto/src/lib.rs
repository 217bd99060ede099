//! Wire and configuration types for the Tailwind CSS worker pool.
//!
//! This crate has no process-spawning or locking logic; see
//! `tailwind-pool-core` for the scheduler, worker state machine, and
//! capture protocol that operate on these types.

pub mod types;

pub use types::*;
