use hyper::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables that override the configuration file
pub const ENV_WEB_ROOT: &str = "WEB_ROOT";
pub const ENV_SERVER_PORT: &str = "SERVER_PORT";
pub const ENV_PROXY_TARGET: &str = "PROXY_TARGET";
pub const ENV_PHP_BINARY: &str = "PHP_BINARY";

/// Dotenv file read from the working directory at startup
pub const DOTENV_FILE: &str = ".env";

/// Startup faults. Any of these stops the process before it serves traffic.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to load {}: {source}", .path.display())]
    DotEnv {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Content tree settings
    #[serde(default)]
    pub content: ContentConfig,

    /// PHP interpreter settings
    #[serde(default)]
    pub php: PhpConfig,

    /// Reverse proxy settings for the /api/ prefix
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// How long in-flight requests may run after an interrupt (default: 30)
    #[serde(default = "default_server_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// How long a client may take to send request headers (default: 5)
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            shutdown_grace_period_secs: default_server_grace_period(),
            header_read_timeout_secs: default_header_read_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContentConfig {
    /// Directory exposed as the web-accessible tree (required)
    pub root: Option<PathBuf>,
}

/// Settings for the PHP interpreter.
///
/// # Security Warning
///
/// `binary` is executed directly, both per request and as a long-lived
/// server. Configuration files must be protected with appropriate file
/// permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct PhpConfig {
    /// Path to the interpreter executable
    #[serde(default = "default_php_binary")]
    pub binary: PathBuf,

    /// Loopback host the persistent interpreter binds to
    #[serde(default = "default_php_host")]
    pub host: String,

    /// Port the persistent interpreter binds to
    #[serde(default = "default_php_port")]
    pub port: u16,

    /// Start a persistent interpreter on first use (default: true)
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Deadline for the persistent interpreter to accept connections
    #[serde(default = "default_php_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness probes while starting
    #[serde(default = "default_php_ready_interval")]
    pub ready_check_interval_ms: u64,

    /// Maximum run time of a single script
    #[serde(default = "default_php_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL at shutdown
    #[serde(default = "default_php_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for PhpConfig {
    fn default() -> Self {
        Self {
            binary: default_php_binary(),
            host: default_php_host(),
            port: default_php_port(),
            persistent: true,
            startup_timeout_secs: default_php_startup_timeout(),
            ready_check_interval_ms: default_php_ready_interval(),
            exec_timeout_secs: default_php_exec_timeout(),
            shutdown_grace_period_secs: default_php_grace_period(),
        }
    }
}

impl PhpConfig {
    /// Address handed to `-S`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_check_interval(&self) -> Duration {
        Duration::from_millis(self.ready_check_interval_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Upstream origin for /api/ (feature disabled when unset)
    pub upstream: Option<String>,

    /// Maximum time to wait for the upstream response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections kept to the upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parse the upstream origin, if one is configured
    pub fn upstream_origin(&self) -> Result<Option<Uri>, ConfigError> {
        let Some(raw) = self.upstream.as_deref() else {
            return Ok(None);
        };

        let invalid = || ConfigError::InvalidValue {
            name: "proxy.upstream",
            value: raw.to_string(),
        };

        let uri: Uri = raw.trim().parse().map_err(|_| invalid())?;
        // The upstream client speaks plain HTTP only
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(invalid());
        }

        Ok(Some(uri))
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_server_grace_period() -> u64 {
    30
}

fn default_header_read_timeout() -> u64 {
    5
}

fn default_php_binary() -> PathBuf {
    PathBuf::from("drivers/php/php")
}

fn default_php_host() -> String {
    "127.0.0.1".to_string()
}

fn default_php_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_php_startup_timeout() -> u64 {
    10
}

fn default_php_ready_interval() -> u64 {
    100 // 100ms
}

fn default_php_exec_timeout() -> u64 {
    30
}

fn default_php_grace_period() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

/// Variables loaded from a `.env` file.
///
/// Consulted only for names the process environment does not set, so
/// exported variables always win. A missing file is an empty set; a file
/// that exists but does not parse is a startup fault.
#[derive(Debug, Clone, Default)]
pub struct DotEnv {
    vars: HashMap<String, String>,
}

impl DotEnv {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let fault = |source| ConfigError::DotEnv {
            path: path.to_path_buf(),
            source,
        };

        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) if e.not_found() => return Ok(Self::default()),
            Err(e) => return Err(fault(e)),
        };

        let mut vars = HashMap::new();
        for item in iter {
            let (name, value) = item.map_err(fault)?;
            vars.insert(name, value);
        }
        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Lookup that prefers `env` and falls back to the file
    pub fn layered<'a, F>(&'a self, env: F) -> impl Fn(&str) -> Option<String> + 'a
    where
        F: Fn(&str) -> Option<String> + 'a,
    {
        move |name| env(name).or_else(|| self.get(name))
    }
}

impl Config {
    /// Parse a configuration file without validating it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Build the startup configuration.
    ///
    /// An explicitly named file must exist; the default file is optional.
    /// Environment variables are applied on top and the result is validated.
    pub fn from_sources<F>(path: &Path, explicit: bool, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if explicit || path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply WEB_ROOT, SERVER_PORT, PROXY_TARGET and PHP_BINARY
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(root) = non_empty(ENV_WEB_ROOT) {
            self.content.root = Some(PathBuf::from(root));
        }

        if let Some(port) = non_empty(ENV_SERVER_PORT) {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_SERVER_PORT,
                value: port.clone(),
            })?;
        }

        if let Some(upstream) = non_empty(ENV_PROXY_TARGET) {
            self.proxy.upstream = Some(upstream);
        }

        if let Some(binary) = non_empty(ENV_PHP_BINARY) {
            self.php.binary = PathBuf::from(binary);
        }

        Ok(())
    }

    /// Validate all configuration and canonicalize the content root
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        match self.content.root.as_ref() {
            None => errors.push(format!(
                "content.root is not set (configure it or export {})",
                ENV_WEB_ROOT
            )),
            Some(root) => match std::fs::metadata(root) {
                Ok(meta) if meta.is_dir() => match root.canonicalize() {
                    Ok(canonical) => self.content.root = Some(canonical),
                    Err(e) => errors.push(format!(
                        "content.root '{}' cannot be resolved: {}",
                        root.display(),
                        e
                    )),
                },
                Ok(_) => errors.push(format!(
                    "content.root '{}' is not a directory",
                    root.display()
                )),
                Err(e) => errors.push(format!(
                    "content.root '{}' does not exist: {}",
                    root.display(),
                    e
                )),
            },
        }

        if let Err(e) = self.proxy.upstream_origin() {
            errors.push(e.to_string());
        }

        if self.php.persistent && self.php.port == 0 {
            errors.push("php.port must be greater than 0".to_string());
        }

        if self.php.ready_check_interval_ms == 0 {
            errors.push("php.ready_check_interval_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    /// The validated content root.
    ///
    /// Only meaningful after [`Config::validate`] succeeded.
    pub fn content_root(&self) -> &Path {
        self.content
            .root
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
    }
}
