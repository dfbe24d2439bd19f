//! Agent health

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use super::format_timestamp;
use crate::client::ApiClient;
use crate::output::{color_status, print_json, print_rows, print_warning, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (status, report) = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Agent Health".bold());
            println!("{}", "=".repeat(50));
            println!("Status:                 {}", color_status(&report.status));
            println!("Ticks completed:        {}", report.ticks_completed);
            println!(
                "Last tick:              {}",
                format_timestamp(report.last_tick_at.as_ref())
            );
            println!();

            let rows = report
                .components
                .into_iter()
                .map(|(name, component)| ComponentRow {
                    name,
                    status: color_status(&component.status),
                    message: component.message.unwrap_or_default(),
                })
                .collect();
            print_rows(rows, "No components registered");

            if !status.is_success() {
                print_warning(&format!("Agent answered {}", status));
            }
        }
    }

    Ok(())
}
