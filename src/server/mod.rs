//! HTTP surface and process-level plumbing
//!
//! Provides:
//! - `/schedules` - CRUD over the persisted schedule set
//! - `/health` - liveness, backed by a store ping
//! - `/metrics` - Prometheus metrics endpoint
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

mod http;
pub mod metrics;
pub mod shutdown;

pub use http::{router, run_server, ApiState, ScheduleRepository};
pub use metrics::{create_metrics, SchedulerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "http_test.rs"]
mod http_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
