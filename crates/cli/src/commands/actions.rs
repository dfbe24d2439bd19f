//! Audit log of controller decisions

use anyhow::Result;
use tabled::Tabled;

use super::format_timestamp;
use crate::client::{ActionRecord, ActionValues, ApiClient};
use crate::output::{
    color_status, format_bytes, format_confidence, format_cpu, print_json, print_rows, OutputFormat,
};

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Workload")]
    workload: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Decision")]
    decision: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

fn describe(values: &ActionValues) -> String {
    let mut parts = Vec::new();
    if let Some(replicas) = values.replicas {
        parts.push(format!("{} replicas", replicas));
    }
    if let Some(cpu) = values.cpu_millicores {
        parts.push(format!("cpu {}", format_cpu(cpu)));
    }
    if let Some(memory) = values.memory_bytes {
        parts.push(format!("mem {}", format_bytes(memory)));
    }
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}

fn change(record: &ActionRecord) -> String {
    let pre = describe(&record.pre);
    let post = describe(&record.post);
    if pre == "-" && post == "-" {
        "-".to_string()
    } else {
        format!("{} -> {}", pre, post)
    }
}

/// Show recent action records, newest first
pub async fn show_actions(
    client: &ApiClient,
    namespace: Option<String>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let mut path = format!("api/v1/actions?limit={}", limit);
    if let Some(ns) = &namespace {
        path.push_str(&format!("&namespace={}", ns));
    }
    let records: Vec<ActionRecord> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => {
            let rows = records
                .iter()
                .map(|r| ActionRow {
                    time: format_timestamp(Some(&r.applied_at)),
                    workload: format!(
                        "{}/{}",
                        r.recommendation.workload.namespace, r.recommendation.workload.name
                    ),
                    action: r.recommendation.action.clone(),
                    confidence: format_confidence(r.recommendation.confidence),
                    decision: color_status(&r.decision),
                    change: change(r),
                    reason: r
                        .reason
                        .clone()
                        .unwrap_or_else(|| r.recommendation.rationale.clone()),
                })
                .collect();
            print_rows(rows, "No actions recorded");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_values() {
        let values = ActionValues {
            replicas: Some(3),
            cpu_millicores: Some(500),
            memory_bytes: None,
        };
        assert_eq!(describe(&values), "3 replicas, cpu 500m");
        assert_eq!(describe(&ActionValues::default()), "-");
    }
}
