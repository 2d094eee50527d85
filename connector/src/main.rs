use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use connector::client::{ApiClient, ConnectionProbe};
use connector::{metrics, ConnectorConfig, SyncWatermark};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "connector", version, about = "Incremental smart meter connector")]
struct Cli {
    /// JSON configuration file; flags and env vars override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "API_URL", global = true)]
    api_url: Option<String>,

    #[arg(long, env = "API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sync round and advance the state file
    Sync {
        /// Watermark file, created on the first successful sync
        #[arg(long, default_value = "state.json")]
        state: PathBuf,

        /// Write records to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print Prometheus metrics to stderr when done
        #[arg(long)]
        print_metrics: bool,
    },
    /// Print the table schema
    Schema,
    /// Test the connection to the API
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Sync {
            state,
            output,
            print_metrics,
        } => run_sync(&config, &state, output.as_deref(), print_metrics).await,
        Command::Schema => {
            let schema = connector::schema(&config);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Command::Check => {
            let client = ApiClient::new(&config)?;
            if !client.test_connection().await {
                bail!("Failed to connect to smart meter API at {}", config.api_url);
            }
            info!("Connection to {} successful", config.api_url);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<ConnectorConfig> {
    let mut config = match &cli.config {
        Some(path) => ConnectorConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConnectorConfig::default(),
    };

    if let Some(api_url) = &cli.api_url {
        config.api_url = api_url.clone();
    }
    if let Some(api_key) = &cli.api_key {
        config.api_key = api_key.clone();
    }

    Ok(config.normalized()?)
}

async fn run_sync(
    config: &ConnectorConfig,
    state_path: &Path,
    output: Option<&Path>,
    print_metrics: bool,
) -> Result<()> {
    metrics::init_metrics();

    let prior = read_state(state_path)?;
    info!("Starting sync against {}", config.api_url);
    match prior.last_sync_timestamp {
        Some(last) => info!("Resuming from watermark {}", last),
        None => info!("No watermark found, bootstrapping first sync"),
    }

    let result = tokio::select! {
        result = connector::update(config, &prior) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, state file left untouched");
            return Ok(());
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Sync failed, state file left untouched: {}", e);
            return Err(e.into());
        }
    };

    let document = serde_json::json!({
        "records": outcome.records,
        "state": outcome.state,
        "diagnostics": outcome.diagnostics,
    });
    let rendered = serde_json::to_string_pretty(&document)?;
    match output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write records to {}", path.display()))?,
        None => println!("{}", rendered),
    }

    write_state(state_path, &outcome.state)?;
    info!(
        "New state: {} devices, {} readings, watermark {:?}",
        outcome.state.total_devices, outcome.state.total_readings, outcome.state.last_sync_timestamp
    );

    if print_metrics {
        eprintln!("{}", metrics::gather_metrics());
    }

    Ok(())
}

fn read_state(path: &Path) -> Result<SyncWatermark> {
    if !path.exists() {
        return Ok(SyncWatermark::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state from {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(SyncWatermark::default());
    }

    serde_json::from_str(&raw).with_context(|| format!("Invalid state in {}", path.display()))
}

/// Writes to a temporary sibling, then renames it over the state file.
fn write_state(path: &Path, state: &SyncWatermark) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(state)?)
        .with_context(|| format!("Failed to write state to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace state file {}", path.display()))?;
    Ok(())
}
