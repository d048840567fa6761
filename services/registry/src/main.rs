//! `harbor-server`: serve the token endpoint, the `/v2` registry and the
//! management API from a TOML configuration file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use eyre::WrapErr;
use harbor_core::config::LogFormat;
use harbor_registry::{Config, RegistryBuilder};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "harbor-server")]
#[command(about = "Harbor registry access plane", long_about = None)]
struct Cli {
    /// Configuration file. Defaults apply when omitted.
    #[arg(long, short, env = "HARBOR_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, short, env = "HARBOR_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let document = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    toml::from_str(&document).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default());
    match config.log.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Could not listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config);

    let registry = RegistryBuilder::new(config).build()?;
    registry.start().await?;

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .wrap_err_with(|| format!("binding {}", cli.listen))?;
    tracing::info!(address = %cli.listen, "Serving registry");

    axum::serve(listener, registry.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    Ok(())
}
