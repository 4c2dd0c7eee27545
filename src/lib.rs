//! Chronos: periodic shell task runner with retries and health reporting.

pub mod config;
pub mod error;
pub mod health;
pub mod job;
pub mod logging;
pub mod shutdown;
pub mod worker;

pub use config::{Config, TaskSpec};
pub use job::Job;
pub use worker::Worker;
