use fastpush::auth::TokenAuth;
use fastpush::config::Config;
use fastpush::controller::Controller;
use fastpush::gateway::{Gateway, PKG_NAME, VERSION};
use fastpush::proxy::BackendProxy;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "fastpush.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fastpush=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config(std::env::args().nth(1).map(PathBuf::from))?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = Controller::from_config(&config);
    let supervisor = Arc::clone(controller.supervisor());

    // Bring the backend up before taking traffic
    if config.backend.command().is_some() {
        match supervisor.restart(None).await {
            Ok(_) => info!("Backend started"),
            Err(e) => error!(error = %e, "Failed to start backend"),
        }
    } else {
        warn!("No backend command configured, waiting for an explicit restart");
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind_address, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let gateway = Gateway::new(
        bind_addr,
        Arc::clone(&controller),
        BackendProxy::new(config.backend.host.clone(), config.backend.port),
        &config.server.base_path,
        TokenAuth::new(&config.server.auth_token),
        shutdown_rx,
    );

    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    supervisor.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), gateway_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// An explicit path must exist. Without one, `fastpush.toml` is read if
/// present and the defaults plus environment are used otherwise.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    if !explicit && !Path::new(&path).exists() {
        info!("No configuration file found, using defaults and environment");
        return Config::from_env();
    }

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting controller");
    info!(
        bind = %config.server.bind_address,
        port = config.server.port,
        base_path = %config.server.base_path,
        auth = !config.server.auth_token.is_empty(),
        "Server configuration"
    );
    info!(
        command = config.backend.command().unwrap_or("<none>"),
        host = %config.backend.host,
        port = config.backend.port,
        dirs = %config.backend.dirs,
        "Backend configuration"
    );
    info!(
        restart_regex = config.backend.restart_pattern().unwrap_or("<none>"),
        ignore_regex = config.backend.ignore_pattern().unwrap_or("<none>"),
        shutdown_grace_period_secs = ?config.backend.shutdown_grace_period_secs,
        "Restart policy"
    );
}
