use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default configuration file looked up when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "dockgate.toml";

/// Global configuration for the proxy
///
/// Every field has a default; the proxy runs without any configuration file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound forwarding settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Docker connection and event feed settings
    #[serde(default)]
    pub docker: DockerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the proxy listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP/WebSocket proxy port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address for the management API (default: 127.0.0.1)
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Management API port (default: 8080, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for mutating management calls
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Domain suffix shown in logs and management responses (default: localhost)
    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_bind: default_admin_bind(),
            admin_port: default_admin_port(),
            admin_token: None,
            domain: default_domain(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Timeout for establishing a TCP connection to a backend
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum time to wait for a backend's response headers, and for each
    /// body chunk after them
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for the backend WebSocket handshake
    #[serde(default = "default_websocket_connect_timeout")]
    pub websocket_connect_timeout_secs: u64,

    /// Time allowed for closing the remaining leg of a WebSocket bridge
    #[serde(default = "default_websocket_close_timeout")]
    pub websocket_close_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ProxySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn websocket_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.websocket_connect_timeout_secs)
    }

    pub fn websocket_close_timeout(&self) -> Duration {
        Duration::from_secs(self.websocket_close_timeout_secs)
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            websocket_connect_timeout_secs: default_websocket_connect_timeout(),
            websocket_close_timeout_secs: default_websocket_close_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerSettings {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,

    /// Network whose address is preferred when a container has several
    pub network: Option<String>,

    /// Remove a route when the container that registered it stops (default: true)
    #[serde(default = "default_true")]
    pub prune_on_stop: bool,

    /// Register already-running containers on every (re)connect (default: true)
    #[serde(default = "default_true")]
    pub resync_on_connect: bool,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Consecutive failed reconnects before the feed is given up (0 = never)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            host: None,
            network: None,
            prune_on_stop: true,
            resync_on_connect: true,
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
            max_reconnect_attempts: 0,
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8080
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    20
}

fn default_websocket_connect_timeout() -> u64 {
    10
}

fn default_websocket_close_timeout() -> u64 {
    5
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_reconnect_base() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given; otherwise use the default file when it exists,
    /// falling back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            None => Ok(Self::default()),
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.proxy.connect_timeout_secs == 0 {
            errors.push("proxy.connect_timeout_secs must be greater than 0".to_string());
        }
        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than 0".to_string());
        }
        if self.proxy.websocket_connect_timeout_secs == 0 {
            errors.push("proxy.websocket_connect_timeout_secs must be greater than 0".to_string());
        }
        if self.docker.reconnect_base_ms > self.docker.reconnect_max_ms {
            errors.push(format!(
                "docker.reconnect_base_ms ({}) exceeds docker.reconnect_max_ms ({})",
                self.docker.reconnect_base_ms, self.docker.reconnect_max_ms
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
