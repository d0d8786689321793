pub mod bootstrap;

use crate::proxy::{ClientIp, ReverseProxyManager};
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Accept loop in front of the proxy manager.
///
/// Each request gets the TCP peer address as a `ClientIp` extension. When
/// `shutdown` fires the listener stops accepting and waits up to
/// `drain_timeout` for open connections to finish.
pub async fn run_proxy_server(
    listener: TcpListener,
    manager: Arc<ReverseProxyManager>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<()> {
    info!("server: proxy listening, addr={}", listener.local_addr()?);
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: proxy: stop accepting new connections, draining");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                continue;
            }
        };

        active_conns.fetch_add(1, Ordering::Relaxed);
        let manager = manager.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            serve_connection(stream, peer_addr, manager).await;
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    drain(&active_conns, drain_timeout).await;
    Ok(())
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<ReverseProxyManager>,
) {
    let io = TokioIo::new(stream);
    let svc = service_fn(move |mut req: Request<Incoming>| {
        let manager = manager.clone();
        req.extensions_mut().insert(ClientIp(peer_addr.ip()));
        async move { Ok::<_, Infallible>(manager.handle(req).await) }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(Duration::from_secs(20)))
        .serve_connection(io, svc)
        .await
    {
        if !e.to_string().contains("connection closed") {
            error!(
                "server: proxy: connection error, peer={}, error={}",
                peer_addr, e
            );
        }
    }
}

async fn drain(active_conns: &AtomicI64, timeout: Duration) {
    let active = active_conns.load(Ordering::Relaxed);
    if active <= 0 {
        return;
    }
    info!("server: proxy: waiting for connections to drain, active={}", active);
    let wait = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(_) => info!("server: proxy: all connections drained"),
        Err(_) => info!(
            "server: proxy: drain timeout, timeout_secs={}, still_active={}",
            timeout.as_secs(),
            active_conns.load(Ordering::Relaxed)
        ),
    }
}
