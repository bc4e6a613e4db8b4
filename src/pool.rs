//! Pooled outbound HTTP client
//!
//! Shared by the `/api/` forwarder and the persistent PHP interpreter
//! forwarding path, so both reuse keep-alive connections.

use crate::error::{BoxError, GatewayBody};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{Client, Error as ClientError};
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Why an outbound exchange produced no response
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Nothing accepted the connection
    #[error("connection failed: {0}")]
    Connect(#[source] ClientError),

    /// Connected, but the exchange broke before a response head arrived
    #[error("exchange failed: {0}")]
    Exchange(#[source] ClientError),
}

impl PoolError {
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Connect(_))
    }
}

impl From<ClientError> for PoolError {
    fn from(err: ClientError) -> Self {
        if err.is_connect() {
            PoolError::Connect(err)
        } else {
            PoolError::Exchange(err)
        }
    }
}

/// Outbound request counters, reported at shutdown
#[derive(Debug, Default)]
pub struct PoolStats {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl PoolStats {
    fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests handed to the client
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Requests that ended without a response
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Keep-alive limits of the pooled client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// An HTTP/1.1 client over plain TCP with idle connection reuse
pub struct ConnectionPool {
    client: Client<HttpConnector, GatewayBody>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Outbound client ready"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request whose URI is already absolute
    pub async fn send_request(
        &self,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, PoolError> {
        self.stats.record_sent();

        match self.client.request(req).await {
            Ok(response) => Ok(response.map(|body| body.map_err(BoxError::from).boxed())),
            Err(e) => {
                self.stats.record_failed();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn get(port: u16, path: &str) -> Request<GatewayBody> {
        Request::builder()
            .uri(format!("http://127.0.0.1:{}{}", port, path))
            .body(full_body(""))
            .unwrap()
    }

    /// Keep-alive upstream answering `ok` to every request; counts connections
    async fn spawn_keep_alive_upstream() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            return;
                        }
                        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                        if stream.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (port, connections)
    }

    #[tokio::test]
    async fn test_sequential_requests_share_one_connection() {
        let (port, connections) = spawn_keep_alive_upstream().await;
        let pool = ConnectionPool::new(PoolConfig::default());

        for _ in 0..3 {
            let response = pool.send_request(get(port, "/ping")).await.unwrap();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"ok");
        }

        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().sent(), 3);
        assert_eq!(pool.stats().failed(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new(PoolConfig::default());
        let err = pool.send_request(get(port, "/")).await.unwrap_err();

        assert!(err.is_connect());
        assert_eq!(pool.stats().sent(), 1);
        assert_eq!(pool.stats().failed(), 1);
    }

    #[tokio::test]
    async fn test_hang_up_before_response_is_not_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let _ = stream.read(&mut buf).await;
                drop(stream);
            }
        });

        let pool = ConnectionPool::new(PoolConfig::default());
        let err = pool.send_request(get(port, "/")).await.unwrap_err();

        assert!(!err.is_connect());
        assert!(matches!(err, PoolError::Exchange(_)));
        assert_eq!(pool.stats().failed(), 1);
    }
}
