//! Background terrain pre-generation scheduling engine.
//!
//! Decides what terrain to generate, when, and how fast, without ever
//! generating terrain itself: the host simulation injects adapters for its
//! world state and its single-threaded executor, and the scheduler feeds it a
//! bounded, nearest-first stream of generation requests while watching the
//! host's tick health.

#[macro_use]
extern crate tracing;

pub mod logging;
pub mod config;
pub mod cell;
pub mod coverage;
pub mod tick_health;
pub mod stats;
pub mod util_permits;
pub mod host;
pub mod progress_db;
pub mod scheduler;
