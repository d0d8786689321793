use crate::config::GatewayConfig;
use crate::proxy::ReverseProxyManager;
use crate::server;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Gateway lifecycle: build → warm up → serve → drain → shutdown.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let manager = Arc::new(
        ReverseProxyManager::new(&config.proxies, config.tunables.clone())
            .context("building proxy manager")?,
    );
    // Active checkers start now rather than on the first request.
    manager.warm_up();

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    tracing::info!(
        "server: starting gateway, listen={}, rules={}",
        config.server.listen,
        config.proxies.len()
    );

    let shutdown = CancellationToken::new();
    let mut proxy_handle = tokio::spawn(server::run_proxy_server(
        listener,
        manager.clone(),
        shutdown.clone(),
        Duration::from_secs(config.server.drain_timeout_secs),
    ));

    let served = tokio::select! {
        _ = wait_for_signal() => {
            shutdown.cancel();
            (&mut proxy_handle).await
        }
        result = &mut proxy_handle => result,
    };

    manager.shutdown();

    match served {
        Ok(result) => result?,
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }
    tracing::info!("server: shutdown complete");
    Ok(())
}

/// JSON logs to stdout through a non-blocking writer. `RUST_LOG` overrides
/// the default `info` filter.
pub fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer must outlive every log call.
    std::mem::forget(guard);
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("server: SIGTERM handler not installed, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
