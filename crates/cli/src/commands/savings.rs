//! Energy, carbon and cost ledger commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, LedgerSummary};
use crate::output::{format_carbon, format_currency, format_energy, print_json, print_rows, OutputFormat};

#[derive(Tabled)]
struct WorkloadSavingRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Workload")]
    name: String,
    #[tabled(rename = "Consumed")]
    consumed: String,
    #[tabled(rename = "Saved")]
    saved: String,
    #[tabled(rename = "CO2 Saved")]
    carbon_saved: String,
    #[tabled(rename = "Cost Saved")]
    cost_saved: String,
    #[tabled(rename = "Actions")]
    actions: u64,
}

/// Show the ledger summary, optionally limited to one namespace
pub async fn show_savings(
    client: &ApiClient,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut summary: LedgerSummary = client.get("api/v1/ledger").await?;
    if let Some(ns) = &namespace {
        summary.workloads.retain(|w| &w.workload.namespace == ns);
    }

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            println!("{}", "Energy Ledger".bold());
            println!("{}", "=".repeat(50));
            println!("Region:                 {}", summary.region.cyan());
            println!(
                "Carbon intensity:       {:.3} kg CO2e/kWh",
                summary.carbon_intensity_kg_per_kwh
            );
            println!(
                "Energy price:           {}/kWh",
                format_currency(summary.price_per_kwh, &summary.currency)
            );
            println!();

            println!("{}", "Totals".bold());
            println!("{}", "-".repeat(50));
            println!(
                "Consumed:               {} / {} / {}",
                format_energy(summary.consumed.energy_kwh),
                format_carbon(summary.consumed.carbon_kg),
                format_currency(summary.consumed.cost, &summary.currency)
            );
            println!(
                "{}                  {} / {} / {}",
                "Saved:".bold(),
                format_energy(summary.saved.energy_kwh).green().bold(),
                format_carbon(summary.saved.carbon_kg).green(),
                format_currency(summary.saved.cost, &summary.currency).green()
            );
            println!("Accepted actions:       {}", summary.actions_accepted);
            println!();

            let currency = summary.currency.clone();
            let rows = summary
                .workloads
                .into_iter()
                .map(|w| WorkloadSavingRow {
                    namespace: w.workload.namespace,
                    name: w.workload.name,
                    consumed: format_energy(w.consumed.energy_kwh),
                    saved: format_energy(w.saved.energy_kwh),
                    carbon_saved: format_carbon(w.saved.carbon_kg),
                    cost_saved: format_currency(w.saved.cost, &currency),
                    actions: w.actions_accepted,
                })
                .collect();
            print_rows(rows, "No workloads recorded yet");
        }
    }

    Ok(())
}
