use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use broadcastd::api::{ApiServer, ApiServerConfig, AppState};
use broadcastd::broadcast::Broadcast;
use broadcastd::client::HttpConnector;
use broadcastd::config::ConfigFile;
use broadcastd::logging::init_logging;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "broadcastd", version, about = "Unattended multi-account live broadcasting")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "BROADCASTD_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Start every stream at boot, regardless of the configuration
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let store = ConfigFile::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut config = store.snapshot();
    config.apply_env_overrides();

    let filter = Some(config.logging.filter.as_str()).filter(|f| !f.is_empty());
    let (logging_config, _guard) = init_logging(&config.logging.directory, filter)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %store.path().display(),
        accounts = config.accounts.len(),
        "broadcastd starting"
    );

    let connector = HttpConnector::new(&config.service)?;
    let broadcast = Arc::new(Broadcast::from_config(
        &config,
        Arc::new(connector),
        Arc::new(store),
    ));

    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    let state = AppState::new(broadcast.clone()).with_logging(logging_config);
    let server = ApiServer::new(ApiServerConfig::from(&config.api), state);
    let server_token = server.cancel_token();
    let mut server_task = tokio::spawn(async move { server.run().await });

    if (args.autostart || config.autostart)
        && let Err(e) = broadcast.start_all().await
    {
        warn!(error = %e, "Some streams failed to start");
    }

    let server_exited = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested, draining streams");
            None
        }
        exited = &mut server_task => {
            error!("Control plane exited unexpectedly, draining streams");
            Some(exited)
        }
    };

    if broadcast.is_live()
        && let Err(e) = broadcast.stop_all().await
    {
        error!(error = %e, "Some streams failed to stop cleanly");
    }
    for name in broadcast.stream_names() {
        if let Err(e) = broadcast.stop_stream(name).await {
            error!(account = %name, error = %e, "Failed to stop stream");
        }
    }

    shutdown.cancel();
    server_token.cancel();
    match server_exited {
        Some(exited) => exited??,
        None => server_task.await??,
    }

    info!("broadcastd stopped");
    Ok(())
}
