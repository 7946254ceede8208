//! Mock Endpoint Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use mock_endpoint_server::config::EXAMPLE_CONFIG;
use mock_endpoint_server::{MockServer, MockServerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-endpoint-server",
    about = "Programmable HTTP mock server - endpoint stubbing with match recording",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Listen address, overrides settings.listen
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn load_config(path: &Path, validate: bool) -> Result<MockServerConfig> {
    if path.exists() {
        info!(path = ?path, "Loading configuration");
        MockServerConfig::from_file(path)
    } else if validate {
        anyhow::bail!("Configuration file not found: {:?}", path);
    } else {
        info!("Using default configuration (no endpoints)");
        Ok(MockServerConfig::default())
    }
}

#[cfg(unix)]
fn spawn_reload_on_sighup(server: Arc<MockServer>, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::warn;

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(path = ?path, "SIGHUP received, reloading configuration");
            let config = match MockServerConfig::from_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "Failed to read configuration, keeping current endpoints");
                    continue;
                }
            };
            if let Err(e) = server.reload(&config).await {
                warn!(error = %e, "Failed to load endpoints, keeping current endpoints");
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(_server: Arc<MockServer>, _path: PathBuf) -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        println!("{}", EXAMPLE_CONFIG);
        return Ok(());
    }

    let mut config = load_config(&args.config, args.validate)?;

    // Validate and exit if requested; compiling catches bad paths and templates
    if args.validate {
        let server = MockServer::from_config(&config)?;
        println!(
            "Configuration is valid ({} endpoints in {} mocks)",
            server.endpoint_ids().await.len(),
            config.mocks.len()
        );
        return Ok(());
    }

    if let Some(listen) = args.listen {
        config.settings.listen = listen;
    }

    let server = Arc::new(MockServer::from_config(&config)?);
    spawn_reload_on_sighup(Arc::clone(&server), args.config.clone())?;

    let listener = TcpListener::bind(config.settings.listen).await?;

    tokio::select! {
        result = Arc::clone(&server).serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
