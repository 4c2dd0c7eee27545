//! Aggregate task health over HTTP.
//!
//! - `aggregator`: reads every Job's health on demand
//! - `server`: the `/health` endpoint and its listener
//! - `client`: the caller used by the `healthcheck` subcommand

pub mod aggregator;
pub mod client;
pub mod server;

pub use aggregator::{HealthAggregator, HealthSnapshot};
pub use client::HealthClient;
pub use server::{HealthServer, health_routes};
