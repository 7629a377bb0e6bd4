mod billing;
mod config;
mod credentials;
mod crypto;
mod endpoints;
mod error;
mod router;
mod store;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::billing::{HttpGoogleTokenVerifier, StripeBillingProvider};
use crate::credentials::CredentialAuthority;
use crate::router::{Router as RelayRouter, RouterConfig as LiveRouterConfig};
use crate::store::SqliteStore;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/relay.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.http_port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let mut config = config;
    if config.jwt.secret.is_empty() {
        tracing::warn!("jwt.secret is empty; generating a process-local secret (tokens will not survive a restart)");
        config.jwt.secret = crypto::random_token_hex(32);
    }
    let config = Arc::new(config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
        .parse()
        .context("invalid bind address")?;

    let store = Arc::new(SqliteStore::connect(&config.database.path).await?);
    let credentials = Arc::new(CredentialAuthority::new(Arc::clone(&store), Arc::clone(&config)));
    let router = Arc::new(RelayRouter::new(LiveRouterConfig {
        offline_queue_max: config.router.offline_queue_max,
        offline_ttl: Duration::from_secs(config.router.offline_ttl_sec),
        idle_timeout: Duration::from_secs(config.router.idle_timeout_sec),
        ping_interval: Duration::from_secs(config.router.ping_interval_sec),
        msg_max_bytes: config.router.msg_max_bytes,
    }));
    let billing = Arc::new(StripeBillingProvider::new(config.stripe.clone()));
    let google_verifier = Arc::new(HttpGoogleTokenVerifier::new());

    let state = AppState {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        credentials,
        router: Arc::clone(&router),
        billing,
        google_verifier,
        started_at: std::time::Instant::now(),
    };

    // Health sweep: pings every live handle, closes anything past the idle timeout.
    {
        let router = Arc::clone(&router);
        let interval = router.ping_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                router.health_sweep().await;
            }
        });
    }

    // Offline-queue TTL sweep: drops expired entries even for agents that
    // never reconnect to trigger a drain.
    {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                router.sweep_offline_queues().await;
            }
        });
    }

    // Store cleanup: expired refresh tokens, pairing codes, rate counters, account sessions.
    {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                if let Err(e) = store.cleanup(crate::store::now_unix()).await {
                    tracing::warn!("store cleanup failed: {e}");
                }
            }
        });
    }

    let app = web::build_router(state);

    tracing::info!("relay server listening on {bind_addr}");
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("relay server shut down cleanly");
    Ok(())
}

/// Waits on SIGINT or SIGTERM so in-flight HTTP requests and WebSocket
/// connections get a chance to drain before the listener stops. Router
/// state needs no persistence on the way down — it comes up empty on
/// every restart regardless of how the process exits.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }
}
