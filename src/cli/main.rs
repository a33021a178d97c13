use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use llm_playbook_engine::models::{Params, Playbook};
use llm_playbook_engine::playbooks::{topological_layers, validate_definition};
use reqwest::{Client, Response};
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "llm-pe-cli")]
#[command(about = "LLM Playbook Engine CLI", long_about = None)]
struct Cli {
    #[arg(short, long, env = "LLM_PE_ENDPOINT", default_value = "http://localhost:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health,

    /// Publish a playbook definition (YAML or JSON)
    Publish {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Validate a playbook definition locally and print its dispatch layers
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Start an execution
    Start {
        #[arg(value_name = "PLAYBOOK_ID")]
        playbook_id: String,

        /// Pin a version instead of the latest
        #[arg(short, long)]
        version: Option<u32>,

        /// Initial parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        #[arg(short, long, default_value = "cli")]
        triggered_by: String,
    },

    /// Get execution details
    Get {
        #[arg(value_name = "EXECUTION_ID")]
        id: String,
    },

    /// List executions
    List {
        #[arg(short, long)]
        playbook: Option<String>,

        /// pending, running, succeeded, failed or cancelled
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Cancel an execution
    Cancel {
        #[arg(value_name = "EXECUTION_ID")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Health => {
            let response = client
                .get(format!("{}/health", cli.endpoint))
                .send()
                .await?;
            print_response(response).await?;
        }

        Commands::Publish { file } => {
            let playbook = read_playbook(&file)?;
            let response = client
                .post(format!("{}/v1/playbooks", cli.endpoint))
                .json(&playbook)
                .send()
                .await?;
            print_response(response).await?;
        }

        Commands::Validate { file } => {
            let playbook = read_playbook(&file)?;
            validate_definition(&playbook)
                .with_context(|| format!("{} is not a valid playbook", file.display()))?;
            let layers = topological_layers(&playbook)?;

            println!(
                "{} v{} is valid ({} steps)",
                playbook.id,
                playbook.version,
                playbook.steps.len()
            );
            for (index, layer) in layers.iter().enumerate() {
                println!("  layer {}: {}", index, layer.join(", "));
            }
        }

        Commands::Start {
            playbook_id,
            version,
            params,
            triggered_by,
        } => {
            let params: Params =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            let response = client
                .post(format!("{}/v1/executions", cli.endpoint))
                .json(&json!({
                    "playbook_id": playbook_id,
                    "version": version,
                    "triggered_by": triggered_by,
                    "params": params,
                }))
                .send()
                .await?;
            print_response(response).await?;
        }

        Commands::Get { id } => {
            let response = client
                .get(format!("{}/v1/executions/{}", cli.endpoint, id))
                .send()
                .await?;
            print_response(response).await?;
        }

        Commands::List {
            playbook,
            status,
            limit,
        } => {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(playbook) = playbook {
                query.push(("playbook_id", playbook));
            }
            if let Some(status) = status {
                query.push(("status", status));
            }

            let response = client
                .get(format!("{}/v1/executions", cli.endpoint))
                .query(&query)
                .send()
                .await?;
            print_response(response).await?;
        }

        Commands::Cancel { id } => {
            let response = client
                .post(format!("{}/v1/executions/{}/cancel", cli.endpoint, id))
                .send()
                .await?;
            print_response(response).await?;
        }
    }

    Ok(())
}

fn read_playbook(path: &Path) -> anyhow::Result<Playbook> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let playbook = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        _ => bail!("{}: expected a .yaml, .yml or .json file", path.display()),
    };
    Ok(playbook)
}

async fn print_response(response: Response) -> anyhow::Result<()> {
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("request failed with status {}", status);
    }
    Ok(())
}
