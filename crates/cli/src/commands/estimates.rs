//! Latest power estimates per workload

use anyhow::Result;
use tabled::Tabled;

use super::format_timestamp;
use crate::client::{ApiClient, Estimate};
use crate::output::{format_energy, print_json, print_rows, OutputFormat};

#[derive(Tabled)]
struct EstimateRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Workload")]
    name: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Watts")]
    watts: String,
    #[tabled(rename = "Energy")]
    energy: String,
    #[tabled(rename = "Sampled At")]
    timestamp: String,
}

pub async fn show_estimates(
    client: &ApiClient,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let path = match &namespace {
        Some(ns) => format!("api/v1/estimates?namespace={}", ns),
        None => "api/v1/estimates".to_string(),
    };
    let estimates: Vec<Estimate> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&estimates)?,
        OutputFormat::Table => {
            let rows = estimates
                .into_iter()
                .map(|e| EstimateRow {
                    namespace: e.workload.namespace,
                    name: e.workload.name,
                    node: e.workload.node,
                    watts: format!("{:.2} W", e.estimated_watts),
                    energy: format_energy(e.estimated_kwh),
                    timestamp: format_timestamp(Some(&e.timestamp)),
                })
                .collect();
            print_rows(rows, "No estimates available");
        }
    }

    Ok(())
}
