//! Per-node energy efficiency agent library
//!
//! This crate provides the core functionality for:
//! - Utilization sampling from the Kubernetes metrics API
//! - Linear power and energy estimation
//! - Spike and underutilization detection
//! - Recommendations from an external oracle
//! - Policy-guarded cluster actions with an audit log
//! - Carbon and savings accounting, health checks and observability

pub mod actions;
pub mod anomaly;
pub mod collector;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod estimator;
pub mod health;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod oracle;


pub use config::GuardianConfig;
pub use control_loop::{ControlLoop, ControlLoopBuilder, TickReport};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ledger::{Ledger, LedgerSummary};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
