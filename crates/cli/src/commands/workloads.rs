//! Per-workload policy state and failure reset

use anyhow::{bail, Result};
use colored::Colorize;
use tabled::Tabled;

use super::format_timestamp;
use crate::client::{ApiClient, PolicyEntry, ResetResponse};
use crate::output::{print_json, print_rows, print_success, OutputFormat};

#[derive(Tabled)]
struct PolicyRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Last Action")]
    last_action: String,
    #[tabled(rename = "Cooldown Until")]
    cooldown_until: String,
    #[tabled(rename = "Failures")]
    failures: u32,
}

/// Split `namespace/name`, falling back to the default namespace for a bare name
pub fn parse_workload(spec: &str, default_namespace: Option<&str>) -> Result<(String, String)> {
    match spec.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns.to_string(), name.to_string()))
        }
        Some(_) => bail!("Invalid workload '{}', expected namespace/name", spec),
        None if spec.is_empty() => bail!("Workload name must not be empty"),
        None => match default_namespace {
            Some(ns) => Ok((ns.to_string(), spec.to_string())),
            None => bail!(
                "Workload '{}' has no namespace; use namespace/name or set a default namespace",
                spec
            ),
        },
    }
}

pub async fn show_policy(
    client: &ApiClient,
    namespace: &str,
    name: &str,
    format: OutputFormat,
) -> Result<()> {
    let path = format!("api/v1/workloads/{}/{}/policy", namespace, name);
    let entries: Vec<PolicyEntry> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&entries)?,
        OutputFormat::Table => {
            println!("{} {}/{}", "Policy state for".bold(), namespace, name.cyan());
            println!("{}", "=".repeat(50));
            let rows = entries
                .into_iter()
                .map(|e| PolicyRow {
                    node: e.workload.node,
                    last_action: format_timestamp(e.state.last_action_at.as_ref()),
                    cooldown_until: format_timestamp(e.state.cooldown_until.as_ref()),
                    failures: e.state.consecutive_failures,
                })
                .collect();
            print_rows(rows, "No policy state recorded");
        }
    }

    Ok(())
}

/// Clear the consecutive failure count so the controller acts on the workload again
pub async fn reset_failures(
    client: &ApiClient,
    namespace: &str,
    name: &str,
    format: OutputFormat,
) -> Result<()> {
    let path = format!("api/v1/workloads/{}/{}/reset", namespace, name);
    let result: ResetResponse = client.post(&path).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => print_success(&format!(
            "Cleared {} consecutive failure(s) for {}/{}",
            result.cleared_failures, result.namespace, result.name
        )),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workload() {
        assert_eq!(
            parse_workload("shop/api", None).unwrap(),
            ("shop".to_string(), "api".to_string())
        );
        assert_eq!(
            parse_workload("api", Some("default")).unwrap(),
            ("default".to_string(), "api".to_string())
        );
        assert!(parse_workload("api", None).is_err());
        assert!(parse_workload("shop/", None).is_err());
        assert!(parse_workload("a/b/c", None).is_err());
    }
}
