//! Integration tests for Escudeiro

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use escudeiro::config::{Config, PhpConfig, ServerConfig, ENV_WEB_ROOT};
use escudeiro::dispatcher::Dispatcher;
use escudeiro::php::{InterpreterState, PhpExecutor};
use escudeiro::pool::{ConnectionPool, PoolConfig};
use escudeiro::proxy::Forwarder;
use escudeiro::server::GatewayServer;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A gateway running on an ephemeral port
struct TestGateway {
    port: u16,
    php: Arc<PhpExecutor>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestGateway {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("gateway stops in time")
            .expect("server task completes")
            .expect("server exits cleanly");
    }
}

/// One-shot PHP through `/bin/sh`, so scripts are shell snippets
fn shell_php_config() -> PhpConfig {
    PhpConfig {
        binary: PathBuf::from("/bin/sh"),
        persistent: false,
        exec_timeout_secs: 5,
        ..PhpConfig::default()
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_gateway(root: &Path, php_config: PhpConfig, upstream: Option<SocketAddr>) -> TestGateway {
    let root = root.canonicalize().unwrap();
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let php = Arc::new(PhpExecutor::new(php_config, root.clone(), Arc::clone(&pool)));

    let forwarder = upstream.map(|addr| {
        Forwarder::new(
            format!("http://{}", addr).parse().unwrap(),
            Arc::clone(&pool),
            Duration::from_secs(5),
        )
    });

    let dispatcher = Arc::new(Dispatcher::new(root, Arc::clone(&php), forwarder));
    let server_config = ServerConfig {
        shutdown_grace_period_secs: 5,
        ..ServerConfig::default()
    };
    let server = GatewayServer::new(dispatcher, &server_config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(listener, shutdown_rx));

    TestGateway {
        port,
        php,
        shutdown_tx,
        handle,
    }
}

/// Parsed HTTP/1.1 response
struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn parse_response(raw: &[u8]) -> HttpResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header block");
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut lines = head.split("\r\n");

    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("valid status line");
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    HttpResponse {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

/// Send a request with extra header lines and read the whole response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    extra_headers: &str,
) -> Result<HttpResponse, Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port, extra_headers
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(parse_response(&response))
}

async fn http_get(port: u16, path: &str) -> Result<HttpResponse, Box<dyn std::error::Error + Send + Sync>> {
    http_request(port, "GET", path, "").await
}

/// Upstream that echoes the method and path it receives
async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let body = format!("{} {}", req.method(), req.uri());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Content tree with `a.txt` and `sub/` at the top
fn sample_site() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a.txt"), b"alpha\n").unwrap();
    std::fs::create_dir(tmp.path().join("sub")).unwrap();
    std::fs::write(tmp.path().join("sub").join("inner.txt"), b"inner").unwrap();
    tmp
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_full_config_parsing() {
    let tmp = tempfile::tempdir().unwrap();
    let config_path = tmp.path().join("escudeiro.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[server]
bind = "127.0.0.1"
port = 9000

[content]
root = {:?}

[php]
binary = "/usr/bin/php"
persistent = false

[proxy]
upstream = "http://127.0.0.1:3000"
"#,
            tmp.path()
        ),
    )
    .unwrap();

    let config = Config::from_sources(&config_path, true, |_| None).unwrap();
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.content_root(), tmp.path().canonicalize().unwrap());
    assert!(!config.php.persistent);
    assert!(config.proxy.upstream_origin().unwrap().is_some());
}

#[test]
fn test_web_root_env_without_config_file() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_string_lossy().to_string();

    let config = Config::from_sources(Path::new("/nonexistent/escudeiro.toml"), false, |name| {
        (name == ENV_WEB_ROOT).then(|| root.clone())
    })
    .unwrap();

    assert_eq!(config.content_root(), tmp.path().canonicalize().unwrap());
}

// ============================================================================
// Static File Tests
// ============================================================================

#[tokio::test]
async fn test_static_file_exact_bytes() {
    let site = sample_site();
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    std::fs::write(site.path().join("blob.bin"), &payload).unwrap();

    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_get(gateway.port, "/files/blob.bin").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, payload);
    assert_eq!(response.header("Content-Length"), Some("4096"));

    let response = http_get(gateway.port, "/files/a.txt").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"alpha\n");

    gateway.stop().await;
}

#[tokio::test]
async fn test_missing_file_returns_404() {
    let site = sample_site();
    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_get(gateway.port, "/files/missing.txt").await.unwrap();
    assert_eq!(response.status, 404);

    gateway.stop().await;
}

#[tokio::test]
async fn test_range_request_returns_slice() {
    let site = sample_site();
    std::fs::write(site.path().join("digits.txt"), b"0123456789").unwrap();
    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_request(gateway.port, "GET", "/files/digits.txt", "Range: bytes=2-5\r\n")
        .await
        .unwrap();
    assert_eq!(response.status, 206);
    assert_eq!(response.body, b"2345");
    assert_eq!(response.header("Content-Range"), Some("bytes 2-5/10"));

    gateway.stop().await;
}

// ============================================================================
// Index and PHP Tests
// ============================================================================

#[tokio::test]
async fn test_index_html_preferred_over_index_php() {
    let site = sample_site();
    let dir = site.path().join("both");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("index.html"), b"<h1>static</h1>").unwrap();
    std::fs::write(dir.join("index.php"), b"printf dynamic").unwrap();

    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_get(gateway.port, "/files/both/").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "<h1>static</h1>");

    gateway.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_index_php_only_directory_runs_script() {
    let site = sample_site();
    let dir = site.path().join("app");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("index.php"), b"printf 'generated page'").unwrap();

    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_get(gateway.port, "/files/app/").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "generated page");
    assert_eq!(response.header("Content-Type"), Some("text/html; charset=utf-8"));

    gateway.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_php_failure_returns_500_with_diagnostic() {
    let site = sample_site();
    std::fs::write(site.path().join("broken.php"), b"echo 'Fatal error: boom' >&2; exit 1").unwrap();

    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_get(gateway.port, "/files/broken.php").await.unwrap();
    assert_eq!(response.status, 500);
    assert!(response.text().contains("Fatal error: boom"));

    gateway.stop().await;
}

/// Fake interpreter: `-S` mode records the start and never listens,
/// script mode prints the script file
#[cfg(unix)]
fn fake_interpreter(dir: &Path, starts: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-php");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"-S\" ]; then\n  echo start >> '{}'\n  exec sleep 30\nfi\ncat \"$1\"\n",
        starts.display()
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_php_requests_start_interpreter_once() {
    let site = sample_site();
    std::fs::write(site.path().join("index.php"), b"<p>hello</p>").unwrap();
    let bin_dir = tempfile::tempdir().unwrap();
    let starts = bin_dir.path().join("starts.log");

    let php_config = PhpConfig {
        binary: fake_interpreter(bin_dir.path(), &starts),
        port: free_port(),
        persistent: true,
        startup_timeout_secs: 1,
        ready_check_interval_ms: 20,
        exec_timeout_secs: 5,
        shutdown_grace_period_secs: 1,
        ..PhpConfig::default()
    };
    let gateway = start_gateway(site.path(), php_config, None).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let port = gateway.port;
        handles.push(tokio::spawn(async move {
            http_get(port, "/files/index.php").await.unwrap()
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "<p>hello</p>");
    }

    let recorded = std::fs::read_to_string(&starts).unwrap();
    assert_eq!(recorded.lines().count(), 1, "interpreter started more than once");
    assert_eq!(gateway.php.state(), InterpreterState::Failed);

    gateway.stop().await;
}

// ============================================================================
// Listing Tests
// ============================================================================

#[tokio::test]
async fn test_root_listing_shows_entries() {
    let site = sample_site();
    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_get(gateway.port, "/").await.unwrap();
    assert_eq!(response.status, 200);

    let html = response.text();
    assert!(html.contains("<title>Escudeiro</title>"));
    assert!(html.contains(r#"href="/files/a.txt""#));
    assert!(html.contains(r#"href="sub/""#));

    let response = http_get(gateway.port, "/sub/").await.unwrap();
    assert_eq!(response.status, 200);
    assert!(response.text().contains(r#"href="/files/sub/inner.txt""#));

    gateway.stop().await;
}

#[tokio::test]
async fn test_redirects_never_leave_the_gateway() {
    let site = sample_site();
    std::fs::create_dir(site.path().join("evil.example")).unwrap();
    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_get(gateway.port, "//evil.example").await.unwrap();
    assert_eq!(response.status, 301);
    assert_eq!(response.header("Location"), Some("/evil.example/"));

    let response = http_get(gateway.port, "/files").await.unwrap();
    assert_eq!(response.status, 301);
    assert_eq!(response.header("Location"), Some("/files/"));

    let response = http_get(gateway.port, "/files/sub").await.unwrap();
    assert_eq!(response.status, 301);
    assert_eq!(response.header("Location"), Some("/files/sub/"));

    gateway.stop().await;
}

#[tokio::test]
async fn test_non_get_returns_405() {
    let site = sample_site();
    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    let response = http_request(gateway.port, "POST", "/", "").await.unwrap();
    assert_eq!(response.status, 405);
    assert!(response.text().contains("Method not allowed"));

    let response = http_request(gateway.port, "PUT", "/files/a.txt", "").await.unwrap();
    assert_eq!(response.status, 405);

    gateway.stop().await;
}

#[tokio::test]
async fn test_path_traversal_returns_400() {
    let site = sample_site();
    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    for path in [
        "/files/../../etc/passwd",
        "/files/%2e%2e/%2e%2e/etc/passwd",
        "/..%2f..%2f",
    ] {
        let response = http_get(gateway.port, path).await.unwrap();
        assert_eq!(response.status, 400, "{}", path);
    }

    gateway.stop().await;
}

// ============================================================================
// Proxy Tests
// ============================================================================

#[tokio::test]
async fn test_api_without_upstream_returns_404() {
    let site = sample_site();
    let gateway = start_gateway(site.path(), shell_php_config(), None).await;

    for method in ["GET", "POST"] {
        let response = http_request(gateway.port, method, "/api/users", "").await.unwrap();
        assert_eq!(response.status, 404, "{}", method);
    }

    gateway.stop().await;
}

#[tokio::test]
async fn test_api_forwards_unstripped_path_and_method() {
    let site = sample_site();
    let upstream = spawn_echo_upstream().await;
    let gateway = start_gateway(site.path(), shell_php_config(), Some(upstream)).await;

    let response = http_request(gateway.port, "POST", "/api/users?page=2", "")
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "POST /api/users?page=2");

    gateway.stop().await;
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_graceful_shutdown_completes_in_flight_request() {
    let site = sample_site();
    std::fs::write(site.path().join("slow.php"), b"sleep 1; printf finished").unwrap();

    let gateway = start_gateway(site.path(), shell_php_config(), None).await;
    let port = gateway.port;

    let in_flight = tokio::spawn(async move { http_get(port, "/files/slow.php").await.unwrap() });
    tokio::time::sleep(Duration::from_millis(300)).await;

    gateway.stop().await;

    let response = in_flight.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "finished");

    assert!(TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_err());
}
