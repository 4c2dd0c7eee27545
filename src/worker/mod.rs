//! Scheduling and coordination.
//!
//! Core components:
//! - `scheduler`: schedule parsing and per-task fire tickers
//! - `worker`: owns the jobs, dispatches fires, runs the health server

pub mod scheduler;
pub mod worker;

pub use scheduler::{Fire, Schedule, Scheduler, Zone};
pub use worker::Worker;
