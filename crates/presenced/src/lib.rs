//! presenced — the attendance daemon around the presence-core engine.
//!
//! Owns the persistent collaborators (gallery store, attendance ledger),
//! the env-var configuration, and the decider engine task that turns one
//! camera frame into one structured attendance outcome.

pub mod config;
pub mod engine;
pub mod ledger;
pub mod store;
