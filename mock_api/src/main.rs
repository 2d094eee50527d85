use anyhow::{Context, Result};
use clap::Parser;
use mock_api::{create_router, MockConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mock_api", about = "Synthetic smart meter API")]
struct Args {
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:5000")]
    addr: String,

    /// Number of simulated meters
    #[arg(long, env = "DEVICES", default_value_t = 3)]
    devices: usize,

    /// Require this bearer token on every request
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting mock smart meter API");
    info!(
        "Devices: {}, auth: {}",
        args.devices,
        if args.api_key.is_some() { "bearer" } else { "none" }
    );

    let app = create_router(MockConfig {
        devices: args.devices,
        api_key: args.api_key,
    });

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    info!("HTTP server listening on {}", args.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
        .context("HTTP server error")?;

    info!("Shutting down");
    Ok(())
}
