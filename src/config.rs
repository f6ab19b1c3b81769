//! Gateway configuration loaded from TOML.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::route::{parse_backend_url, RouteKey};

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH tunnel listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Prometheus metrics listen address; unset disables the metrics server
    pub metrics_listen_addr: Option<String>,

    /// Public key listen address; unset disables the key server
    pub key_listen_addr: Option<String>,

    /// Path to the SSH host key (generated if missing)
    pub host_key_path: PathBuf,

    /// Path to the PKCS#8 PEM Ed25519 key used to sign identity tokens
    pub signing_key_path: PathBuf,

    /// External endpoint that decides whether credentials are valid
    pub authorization_endpoint: String,

    /// Backend URLs reachable through the tunnel
    #[serde(default)]
    pub allowed_backends: Vec<String>,

    /// Accept every client without checking credentials
    pub no_auth: bool,

    /// Identity token settings
    #[serde(default)]
    pub token: TokenConfig,

    /// Timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("tunnel-gateway");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            metrics_listen_addr: Some("0.0.0.0:9100".to_string()),
            key_listen_addr: Some("0.0.0.0:8081".to_string()),
            host_key_path: data_dir.join("host_key"),
            signing_key_path: data_dir.join("signing_key.pem"),
            authorization_endpoint: "http://127.0.0.1:8080/authorize".to_string(),
            allowed_backends: Vec::new(),
            no_auth: false,
            token: TokenConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// One entry of `allowed_backends`.
#[derive(Debug, Clone)]
pub struct Backend {
    pub route: RouteKey,
    pub url: Url,
    /// The URL as configured, used verbatim as the token audience.
    pub audience: String,
}

/// Identity token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// `iss` claim of minted tokens
    pub issuer: String,

    /// Request header carrying the token upstream
    pub header: String,

    /// Token lifetime in seconds
    pub ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "tunnel-gateway".to_string(),
            header: "X-Identity".to_string(),
            ttl_secs: 3600,
        }
    }
}

/// Timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound on one authorization endpoint call
    pub auth_secs: u64,

    /// Upper bound on draining HTTP servers at shutdown
    pub shutdown_grace_secs: u64,

    /// Upper bound on the lifetime of one proxied HTTP connection.
    /// Tunneled streams have no deadlines of their own.
    pub connection_secs: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            auth_secs: 5,
            shutdown_grace_secs: 10,
            connection_secs: None,
        }
    }
}

impl TimeoutConfig {
    pub fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn connection(&self) -> Option<Duration> {
        self.connection_secs.map(Duration::from_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check everything that would otherwise fail later at startup.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.listen_addr))?;

        for addr in [&self.metrics_listen_addr, &self.key_listen_addr]
            .into_iter()
            .flatten()
        {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid listen address: {}", addr))?;
        }

        if !self.no_auth {
            Url::parse(&self.authorization_endpoint).with_context(|| {
                format!(
                    "Invalid authorization endpoint: {}",
                    self.authorization_endpoint
                )
            })?;
        }

        if self.token.ttl_secs == 0 || i64::try_from(self.token.ttl_secs).is_err() {
            bail!("token.ttl_secs must be a positive number of seconds");
        }

        http::HeaderName::from_bytes(self.token.header.as_bytes())
            .with_context(|| format!("Invalid token header name: {}", self.token.header))?;

        self.backends().map(|_| ())
    }

    /// Parse `allowed_backends` into URLs paired with their route identifiers.
    pub fn backends(&self) -> Result<Vec<Backend>> {
        if self.allowed_backends.is_empty() {
            bail!("No allowed_backends configured");
        }

        let mut seen = HashSet::new();
        let mut backends = Vec::with_capacity(self.allowed_backends.len());
        for raw in &self.allowed_backends {
            let url = parse_backend_url(raw)?;
            let route = RouteKey::from_url(&url)?;
            if !seen.insert(route.clone()) {
                return Err(anyhow!("Backend {} duplicates route {}", raw, route));
            }
            backends.push(Backend {
                route,
                url,
                audience: raw.trim().to_string(),
            });
        }
        Ok(backends)
    }

    /// Ensure the host key directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create host key directory: {}", parent.display())
            })?;
        }

        Ok(())
    }
}
