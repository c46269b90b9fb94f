//! Observational health monitoring for deal pipeline runs.
//!
//! [`SystemHealthMonitor`] samples host resources on an interval, keeps a
//! bounded history, aggregates per-agent execution statistics recorded by the
//! orchestrator and raises threshold alerts.

pub mod activity;
pub mod error;
pub mod monitor;
pub mod sampler;

pub use error::MonitorError;
pub use monitor::{HealthSummary, PerformanceReport, SystemHealthMonitor, SystemPerformance};
pub use sampler::{FixedSampler, ResourceSampler, SysinfoSampler};
