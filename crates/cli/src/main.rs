//! Green guardian CLI
//!
//! A command-line tool for reading an agent's energy ledger, audit log and
//! power estimates, and for clearing a halted workload's failure count.

mod client;
mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{actions, estimates, health, savings, workloads};
use output::{print_info, print_success, OutputFormat};

/// Green guardian CLI
#[derive(Parser)]
#[command(name = "ggctl")]
#[command(author, version, about = "CLI for the Green Guardian energy agent", long_about = None)]
pub struct Cli {
    /// Agent endpoint URL (can also be set via GGCTL_AGENT_URL env var or `ggctl config set-url`)
    #[arg(long, env = "GGCTL_AGENT_URL")]
    pub agent_url: Option<String>,

    /// Output format (defaults to the configured format, then table)
    #[arg(long, short, global = true)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show consumed and saved energy, carbon and cost
    Savings {
        /// Filter workloads by namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// Show the action audit log, newest first
    Actions {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,

        /// Maximum number of records
        #[arg(long, short, default_value_t = 50)]
        limit: usize,
    },

    /// Show the latest power estimate per workload
    Estimates {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// Show cooldown and failure state for a workload
    Policy {
        /// Workload (format: namespace/name or just name)
        workload: String,
    },

    /// Clear the consecutive failure count of a halted workload
    Reset {
        /// Workload (format: namespace/name or just name)
        workload: String,
    },

    /// Show agent health
    Health,

    /// Manage local CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Store the agent URL
    SetUrl {
        /// Agent endpoint URL
        url: String,
    },

    /// Store the namespace used for bare workload names
    SetNamespace {
        /// Namespace
        namespace: String,
    },

    /// Store the default output format
    SetFormat {
        /// Output format
        format: OutputFormat,
    },
}

fn run_config(cmd: ConfigCommands, mut cfg: config::Config, agent_url: &str) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            print_info(&format!("Config file:       {}", config::Config::config_path()?.display()));
            print_info(&format!("Agent URL:         {}", agent_url));
            print_info(&format!(
                "Default namespace: {}",
                cfg.default_namespace.as_deref().unwrap_or("-")
            ));
            print_info(&format!(
                "Default format:    {}",
                cfg.default_format.as_deref().unwrap_or("table")
            ));
            return Ok(());
        }
        ConfigCommands::SetUrl { url } => {
            url::Url::parse(&url).with_context(|| format!("Invalid agent URL '{}'", url))?;
            cfg.agent_url = Some(url);
        }
        ConfigCommands::SetNamespace { namespace } => {
            cfg.default_namespace = Some(namespace);
        }
        ConfigCommands::SetFormat { format } => {
            let name = match format {
                OutputFormat::Table => "table",
                OutputFormat::Json => "json",
            };
            cfg.default_format = Some(name.to_string());
        }
    }

    let path = cfg.save()?;
    print_success(&format!("Saved configuration to {}", path.display()));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = config::Config::load()?;
    let agent_url = cfg.agent_url(cli.agent_url.as_deref());
    let format = cli
        .format
        .or_else(|| cfg.default_format.as_deref().and_then(OutputFormat::parse))
        .unwrap_or_default();

    // Initialize client
    let client = client::ApiClient::new(&agent_url)?;

    // Execute command
    match cli.command {
        Commands::Savings { namespace } => {
            savings::show_savings(&client, cfg.namespace(namespace), format).await?;
        }
        Commands::Actions { namespace, limit } => {
            actions::show_actions(&client, cfg.namespace(namespace), limit, format).await?;
        }
        Commands::Estimates { namespace } => {
            estimates::show_estimates(&client, cfg.namespace(namespace), format).await?;
        }
        Commands::Policy { workload } => {
            let (namespace, name) =
                workloads::parse_workload(&workload, cfg.default_namespace.as_deref())?;
            workloads::show_policy(&client, &namespace, &name, format).await?;
        }
        Commands::Reset { workload } => {
            let (namespace, name) =
                workloads::parse_workload(&workload, cfg.default_namespace.as_deref())?;
            workloads::reset_failures(&client, &namespace, &name, format).await?;
        }
        Commands::Health => {
            health::show_health(&client, format).await?;
        }
        Commands::Config(cmd) => {
            run_config(cmd, cfg, &agent_url)?;
        }
    }

    Ok(())
}
