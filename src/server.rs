//! Listener, connection handling and graceful shutdown

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Serves the dispatcher over HTTP/1.1 and HTTP/2
pub struct GatewayServer {
    dispatcher: Arc<Dispatcher>,
    header_read_timeout: Duration,
    shutdown_grace_period: Duration,
}

impl GatewayServer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &ServerConfig) -> Self {
        Self {
            dispatcher,
            header_read_timeout: config.header_read_timeout(),
            shutdown_grace_period: config.shutdown_grace_period(),
        }
    }

    /// Accept connections until `shutdown_rx` turns true.
    ///
    /// In-flight connections then get the grace period to finish before
    /// they are aborted, and the PHP interpreter is stopped last.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        if !*shutdown_rx.borrow() {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let dispatcher = Arc::clone(&self.dispatcher);
                                let drain_rx = drain_rx.clone();
                                let header_read_timeout = self.header_read_timeout;

                                connections.spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, dispatcher, drain_rx, header_read_timeout).await {
                                        debug!(addr = %addr, error = %e, "Connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    // Reap finished connections
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(
            in_flight = connections.len(),
            grace_period_secs = self.shutdown_grace_period.as_secs(),
            "Stopped accepting connections, draining"
        );

        let _ = drain_tx.send(true);
        let drained = tokio::time::timeout(self.shutdown_grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => info!("All connections drained"),
            Err(_) => {
                warn!(
                    remaining = connections.len(),
                    "Grace period exceeded, closing remaining connections"
                );
                connections.shutdown().await;
            }
        }

        self.dispatcher.php().shutdown().await;
        info!("Gateway stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    mut drain_rx: watch::Receiver<bool>,
    header_read_timeout: Duration,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, Infallible>(dispatcher.handle(req, addr).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
            }
            _ = drain_rx.changed(), if !draining => {
                // Finish the in-flight request, then close
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
