use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The single backend every request is forwarded to
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Redirect rewriting
    #[serde(default)]
    pub rewrite: RewriteConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listening port (default: 5173)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// host:port clients use to reach the proxy, substituted into redirects.
    /// Defaults to `{bind}:{port}`.
    pub public_address: Option<String>,

    /// Maximum idle upstream connections kept in the pool (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}:{}': {}", self.bind, self.port, e))
    }

    /// Address substituted into rewritten `Location` headers
    pub fn public_address(&self) -> String {
        self.public_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.bind, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            public_address: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Backend host (default: 127.0.0.1)
    #[serde(default = "default_upstream_host")]
    pub host: String,

    /// Backend port (default: 56294)
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Rewrite the Host header to the backend's own authority (default: true)
    #[serde(default = "default_true")]
    pub change_origin: bool,

    /// Tunnel WebSocket upgrades (default: true). When false, upgrade
    /// requests are forwarded as plain requests.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Set X-Forwarded-For/Host/Proto on forwarded requests (default: false)
    #[serde(default)]
    pub forwarded_headers: bool,

    /// Time allowed to establish a backend connection in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Time allowed for the backend to send response headers in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("upstream.host must not be empty".to_string());
        }
        if self.host.contains(['/', ' ']) || self.host.contains("://") {
            return Err(format!(
                "upstream.host '{}' must be a bare host name or address",
                self.host
            ));
        }
        if self.port == 0 {
            return Err("upstream.port must be non-zero".to_string());
        }
        if self.connect_timeout_ms == 0 {
            return Err("upstream.connect_timeout_ms must be non-zero".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("upstream.request_timeout_secs must be non-zero".to_string());
        }
        Ok(())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            change_origin: true,
            websocket: true,
            forwarded_headers: false,
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RewriteConfig {
    /// Rewrite `Location` headers that point at the backend (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scheme forced onto rewritten locations, e.g. "http" (default: unset)
    pub protocol: Option<String>,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: None,
        }
    }
}

fn default_listen_port() -> u16 {
    5173
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    56294
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.listen_addr() {
            errors.push(e.to_string());
        }

        if let Err(e) = self.upstream.validate() {
            errors.push(e);
        }

        let public = self.server.public_address();
        if public.is_empty() || public.contains('/') {
            errors.push(format!(
                "server.public_address '{}' must be a host:port pair",
                public
            ));
        }

        if let Some(protocol) = &self.rewrite.protocol {
            if protocol != "http" && protocol != "https" {
                errors.push(format!(
                    "rewrite.protocol must be \"http\" or \"https\", got \"{}\"",
                    protocol
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
public_address = "dev.local:8080"

[upstream]
host = "localhost"
port = 3000
change_origin = false
request_timeout_secs = 60

[rewrite]
protocol = "http"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.public_address(), "dev.local:8080");
        assert_eq!(config.upstream.host, "localhost");
        assert_eq!(config.upstream.port, 3000);
        assert!(!config.upstream.change_origin);
        assert!(config.upstream.websocket);
        assert_eq!(config.upstream.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.rewrite.protocol.as_deref(), Some("http"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5173);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.public_address(), "127.0.0.1:5173");
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_default_upstream_config() {
        let upstream = UpstreamConfig::default();
        assert_eq!(upstream.host, "127.0.0.1");
        assert_eq!(upstream.port, 56294);
        assert!(upstream.change_origin);
        assert!(upstream.websocket);
        assert!(!upstream.forwarded_headers);
        assert_eq!(upstream.connect_timeout(), Duration::from_secs(5));
        assert_eq!(upstream.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 5173);
        assert_eq!(config.upstream.port, 56294);
        assert!(config.rewrite.enabled);
        assert!(config.rewrite.protocol.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_addr() {
        let config = ServerConfig {
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );

        let bad = ServerConfig {
            bind: "not an ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(bad.listen_addr().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_upstream_port() {
        let mut config = Config::default();
        config.upstream.port = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("upstream.port"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_url_as_host() {
        let mut config = Config::default();
        config.upstream.host = "http://127.0.0.1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_protocol() {
        let mut config = Config::default();
        config.rewrite.protocol = Some("ftp".to_string());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("rewrite.protocol"), "{}", err);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.upstream.port = 0;
        config.server.public_address = Some("http://x/".to_string());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("upstream.port"));
        assert!(err.contains("server.public_address"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devgate.toml");
        std::fs::write(&path, "[upstream]\nport = 4000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.upstream.port, 4000);
        assert_eq!(config.server.port, 5173);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devgate.toml");
        std::fs::write(&path, "[upstream]\nport = 0\n").unwrap();

        assert!(Config::load(&path).is_err());
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
