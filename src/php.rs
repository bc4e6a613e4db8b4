//! PHP script execution
//!
//! Scripts run either through a persistent `php -S` interpreter, started
//! lazily on first use, or as a one-shot `php <script>` subprocess. The
//! one-shot path is always available as the fallback.

use crate::config::PhpConfig;
use crate::error::{full_body, GatewayBody, GatewayError};
use crate::listing::contains_php_file;
use crate::pool::ConnectionPool;
use crate::proxy::remove_hop_by_hop_headers;
use crate::resolver::ResolvedTarget;
use anyhow::Context;
use hyper::{Request, Response, StatusCode, Uri};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Content type of one-shot script output
const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Lifecycle of the persistent interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterState {
    /// Never started, or the last trigger found no PHP files
    Absent,
    /// Spawned, waiting for the listener to accept connections
    Starting,
    /// Accepting requests
    Running,
    /// Start failed or the process died; never retried
    Failed,
    /// Stopped by the shutdown hook
    Terminated,
}

/// Runs PHP scripts and owns the persistent interpreter process
pub struct PhpExecutor {
    config: PhpConfig,
    root: PathBuf,
    pool: Arc<ConnectionPool>,
    /// Held for the whole start transition so concurrent triggers coalesce
    child: Mutex<Option<Child>>,
    state: watch::Sender<InterpreterState>,
}

impl PhpExecutor {
    pub fn new(config: PhpConfig, root: PathBuf, pool: Arc<ConnectionPool>) -> Self {
        let (state, _) = watch::channel(InterpreterState::Absent);
        Self {
            config,
            root,
            pool,
            child: Mutex::new(None),
            state,
        }
    }

    /// Current interpreter state
    pub fn state(&self) -> InterpreterState {
        *self.state.borrow()
    }

    fn set_state(&self, state: InterpreterState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Interpreter state changed");
        }
    }

    /// Execute a script for a request
    pub async fn execute(
        &self,
        target: &ResolvedTarget,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        if !self.config.persistent {
            return self.execute_once(&target.path).await;
        }

        if self.ensure_started().await != InterpreterState::Running {
            return self.execute_once(&target.path).await;
        }

        match self.forward(target, req).await {
            Err(ForwardError::Connect(e)) => {
                warn!(
                    script = %target.path.display(),
                    error = %e,
                    "Interpreter unreachable, falling back to one-shot execution"
                );
                self.execute_once(&target.path).await
            }
            Err(ForwardError::Gateway(e)) => Err(e),
            Ok(response) => Ok(response),
        }
    }

    /// Run `<binary> <script>` and return its standard output
    pub async fn execute_once(&self, script: &Path) -> Result<Response<GatewayBody>, GatewayError> {
        let binary = &self.config.binary;
        info!(binary = %binary.display(), script = %script.display(), "Executing PHP script");

        let mut cmd = Command::new(binary);
        cmd.arg(script);
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            error!(binary = %binary.display(), error = %e, "Failed to spawn PHP interpreter");
            GatewayError::Interpreter(format!("failed to start {}: {}", binary.display(), e))
        })?;

        let timeout = self.config.exec_timeout();
        // Dropping the future on timeout kills the child
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(script = %script.display(), error = %e, "Failed to collect PHP output");
                return Err(GatewayError::Interpreter(e.to_string()));
            }
            Err(_) => {
                warn!(
                    script = %script.display(),
                    timeout_secs = timeout.as_secs(),
                    "PHP execution timed out, process killed"
                );
                return Err(GatewayError::InterpreterTimeout(timeout.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                output.status.to_string()
            } else {
                format!("{}: {}", output.status, stderr.trim())
            };
            error!(script = %script.display(), error = %detail, "PHP execution failed");
            return Err(GatewayError::Interpreter(detail));
        }

        debug!(script = %script.display(), bytes = output.stdout.len(), "PHP execution completed");

        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, DEFAULT_CONTENT_TYPE)
            .header(hyper::header::CONTENT_LENGTH, output.stdout.len())
            .body(full_body(output.stdout))
            .map_err(|e| GatewayError::Interpreter(e.to_string()))
    }

    /// Start the persistent interpreter if this is the first trigger.
    ///
    /// Returns the state observed once any in-progress start has finished.
    pub async fn ensure_started(&self) -> InterpreterState {
        let mut child = self.child.lock().await;

        match self.state() {
            InterpreterState::Running => {
                if let Some(process) = child.as_mut() {
                    if let Ok(Some(status)) = process.try_wait() {
                        error!(?status, "Persistent interpreter exited unexpectedly");
                        *child = None;
                        self.set_state(InterpreterState::Failed);
                    }
                }
                return self.state();
            }
            InterpreterState::Failed | InterpreterState::Terminated => return self.state(),
            InterpreterState::Absent | InterpreterState::Starting => {}
        }

        match contains_php_file(&self.root).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(root = %self.root.display(), "No PHP files at the content root, interpreter not started");
                return InterpreterState::Absent;
            }
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Failed to scan content root for PHP files");
                return InterpreterState::Absent;
            }
        }

        self.set_state(InterpreterState::Starting);
        match self.start_interpreter().await {
            Ok(process) => {
                *child = Some(process);
                self.set_state(InterpreterState::Running);
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Persistent interpreter failed to start");
                self.set_state(InterpreterState::Failed);
            }
        }

        self.state()
    }

    /// Spawn `<binary> -S host:port -t root` and wait until it accepts connections.
    ///
    /// The address must be free before the spawn, and the child must still be
    /// alive once a connection succeeds. Either check failing means whatever
    /// answers on the port is not this interpreter.
    async fn start_interpreter(&self) -> anyhow::Result<Child> {
        let addr = self.config.listen_addr();
        ensure_address_free(&addr).await?;

        info!(
            binary = %self.config.binary.display(),
            addr = %addr,
            root = %self.root.display(),
            "Starting persistent PHP interpreter"
        );

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-S").arg(&addr).arg("-t").arg(&self.root);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.binary.display()))?;
        let pid = child.id().unwrap_or(0);
        info!(pid, "Interpreter process spawned");

        drain_output(child.stdout.take(), "stdout");
        drain_output(child.stderr.take(), "stderr");

        let timeout = self.config.startup_timeout();
        let interval = self.config.ready_check_interval();
        let start = Instant::now();

        loop {
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("interpreter exited during startup with {}", status);
            }

            if let Ok(Ok(_)) = tokio::time::timeout(interval, TcpStream::connect(&addr)).await {
                if let Some(status) = child.try_wait()? {
                    anyhow::bail!("interpreter exited during startup with {}", status);
                }
                info!(pid, addr = %addr, elapsed_ms = start.elapsed().as_millis() as u64, "Interpreter ready");
                return Ok(child);
            }

            if start.elapsed() > timeout {
                let _ = child.kill().await;
                anyhow::bail!(
                    "interpreter not accepting connections on {} after {}s",
                    addr,
                    timeout.as_secs()
                );
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Relay a request to the running interpreter
    async fn forward(
        &self,
        target: &ResolvedTarget,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, ForwardError> {
        let uri = interpreter_uri(&self.config.listen_addr(), &target.relative, req.uri().query())
            .map_err(|e| ForwardError::Gateway(GatewayError::Interpreter(e)))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        remove_hop_by_hop_headers(&mut parts.headers);
        let outbound = Request::from_parts(parts, body);

        debug!(uri = %outbound.uri(), "Forwarding to persistent interpreter");

        let timeout = self.config.exec_timeout();
        match tokio::time::timeout(timeout, self.pool.send_request(outbound)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_connect() => Err(ForwardError::Connect(e.to_string())),
            Ok(Err(e)) => {
                error!(script = %target.path.display(), error = %e, "Interpreter request failed");
                Err(ForwardError::Gateway(GatewayError::Interpreter(e.to_string())))
            }
            Err(_) => {
                warn!(script = %target.path.display(), timeout_secs = timeout.as_secs(), "Interpreter response timed out");
                Err(ForwardError::Gateway(GatewayError::InterpreterTimeout(timeout.as_secs())))
            }
        }
    }

    /// Stop the persistent interpreter.
    ///
    /// Sends SIGTERM, waits for the grace period, then kills. Later
    /// requests use one-shot execution.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        self.set_state(InterpreterState::Terminated);

        let Some(mut process) = child.take() else {
            return;
        };

        if let Some(pid) = process.id() {
            info!(pid, "Sending SIGTERM to PHP interpreter");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = process.start_kill();
            }
        }

        let grace_period = self.config.shutdown_grace_period();
        match tokio::time::timeout(grace_period, process.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "PHP interpreter exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for PHP interpreter to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = process.kill().await;
            }
        }
    }
}

enum ForwardError {
    /// No connection could be made; one-shot execution can still serve
    Connect(String),
    Gateway(GatewayError),
}

/// Bind and release `addr`, failing if another process already listens there
async fn ensure_address_free(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("interpreter address {} is unavailable", addr))?;
    drop(listener);
    Ok(())
}

/// `http://{addr}/{relative}?{query}` with each path segment re-encoded
fn interpreter_uri(addr: &str, relative: &str, query: Option<&str>) -> Result<Uri, String> {
    let path = relative
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/");

    let uri = match query {
        Some(q) => format!("http://{}/{}?{}", addr, path, q),
        None => format!("http://{}/{}", addr, path),
    };
    uri.parse::<Uri>().map_err(|e| e.to_string())
}

/// Log each line the interpreter writes
fn drain_output<R>(reader: Option<R>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return;
    };

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream, "php: {}", line);
        }
    });
}
