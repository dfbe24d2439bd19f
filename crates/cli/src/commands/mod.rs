//! Subcommand implementations

pub mod actions;
pub mod estimates;
pub mod health;
pub mod savings;
pub mod workloads;

use chrono::{DateTime, Utc};

/// Format an optional timestamp for display
pub(crate) fn format_timestamp(ts: Option<&DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "-".to_string(),
    }
}
