use devgate::config::Config;
use devgate::proxy::ProxyServer;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Config file picked up from the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "devgate.toml";

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::from_config(&config, shutdown_rx)?;

    // Binding happens here, before anything is spawned, so a taken port
    // aborts startup instead of failing in the background.
    let listener = proxy.bind().await.map_err(|e| {
        error!(error = %e, "Cannot start proxy");
        e
    })?;

    let upstream = proxy.route().upstream.clone();
    if !upstream.probe(proxy.route().connect_timeout).await {
        warn!(
            upstream = %upstream.authority(),
            "Backend is not reachable yet; requests will fail with 502 until it starts"
        );
    }

    info!("Dev proxy http://{}", config.server.public_address());

    let stats = proxy.pool().stats();

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Positional path if given, else `devgate.toml` if present, else defaults
fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let path = match config_path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
        None => {
            info!("No configuration file, using built-in defaults");
            return Ok(Config::default());
        }
    };

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

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
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dev proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        public_address = %config.server.public_address(),
        "Listener configuration"
    );
    info!(
        upstream = %format!("{}:{}", config.upstream.host, config.upstream.port),
        change_origin = config.upstream.change_origin,
        websocket = config.upstream.websocket,
        forwarded_headers = config.upstream.forwarded_headers,
        connect_timeout_ms = config.upstream.connect_timeout_ms,
        request_timeout_secs = config.upstream.request_timeout_secs,
        "Upstream configuration"
    );
    info!(
        rewrite = config.rewrite.enabled,
        protocol = ?config.rewrite.protocol,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Redirect rewrite and pool settings"
    );
}
