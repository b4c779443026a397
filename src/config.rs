use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Static process configuration, loaded once at startup.
///
/// The routing table is deliberately absent: routes live in the store and are
/// managed through the control API.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Path to the database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// Token signing secret. If not set, a random secret is generated at
    /// startup and every token is invalidated on restart.
    pub token_secret: Option<String>,

    /// Lifetime of issued tokens in seconds (default: 24h)
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    /// Admin (control API) listen address, TLS only
    #[serde(default = "default_admin_listen")]
    pub listen: String,

    /// Path to the admin certificate (PEM). Self-signed if unset.
    pub cert: Option<String>,

    /// Path to the admin private key (PEM)
    pub key: Option<String>,

    /// Directory with operator console assets
    pub static_dir: Option<PathBuf>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            cert: None,
            key: None,
            static_dir: None,
        }
    }
}

impl AdminConfig {
    pub fn has_tls_files(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http: HttpListenerConfig,

    #[serde(default)]
    pub tls: TlsListenerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpListenerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_http_listen(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsListenerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_tls_listen")]
    pub listen: String,

    /// Certificate served for records referencing the `default` certificate
    pub cert: Option<String>,

    /// Private key matching `cert`
    pub key: Option<String>,

    /// Directory holding `<ref>.crt` and `<ref>.key` pairs for tls-terminate records
    pub cert_dir: Option<PathBuf>,
}

impl Default for TlsListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_tls_listen(),
            cert: None,
            key: None,
            cert_dir: None,
        }
    }
}

/// I/O deadlines for the data plane
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Backend dial deadline
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Relay idle deadline (no bytes in either direction)
    #[serde(default = "default_idle_timeout")]
    pub idle_secs: u64,

    /// Deadline for receiving the ClientHello on the TLS listener
    #[serde(default = "default_sni_timeout")]
    pub sni_secs: u64,

    /// Deadline for completing a terminating TLS handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_secs: u64,

    /// Deadline for receiving backend response headers
    #[serde(default = "default_request_timeout")]
    pub request_secs: u64,

    /// Grace period for in-flight connections at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            idle_secs: default_idle_timeout(),
            sni_secs: default_sni_timeout(),
            handshake_secs: default_handshake_timeout(),
            request_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn sni(&self) -> Duration {
        Duration::from_secs(self.sni_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

// Default value functions
fn default_store_path() -> PathBuf {
    PathBuf::from("routegate.db")
}

fn default_token_ttl() -> u64 {
    24 * 3600
}

fn default_admin_listen() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:80".to_string()
}

fn default_tls_listen() -> String {
    "0.0.0.0:443".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_sni_timeout() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn parse_addr(field: &str, value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("{}: invalid listen address '{}': {}", field, value, e))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = parse_addr("admin.listen", &self.admin.listen) {
            errors.push(e.to_string());
        }
        if self.admin.cert.is_some() != self.admin.key.is_some() {
            errors.push("admin: 'cert' and 'key' must be set together".to_string());
        }

        if self.proxy.http.enabled {
            if let Err(e) = parse_addr("proxy.http.listen", &self.proxy.http.listen) {
                errors.push(e.to_string());
            }
        }

        let tls = &self.proxy.tls;
        if tls.enabled {
            if let Err(e) = parse_addr("proxy.tls.listen", &tls.listen) {
                errors.push(e.to_string());
            }
            if tls.cert.is_some() != tls.key.is_some() {
                errors.push("proxy.tls: 'cert' and 'key' must be set together".to_string());
            }
            if tls.cert.is_none() && tls.cert_dir.is_none() {
                errors.push(
                    "proxy.tls: set 'cert'/'key' or 'cert_dir' so tls-terminate records can be served"
                        .to_string(),
                );
            }
        }

        if self.auth.token_ttl_secs == 0 {
            errors.push("auth.token_ttl_secs must be greater than 0".to_string());
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("connect_secs", t.connect_secs),
            ("idle_secs", t.idle_secs),
            ("sni_secs", t.sni_secs),
            ("handshake_secs", t.handshake_secs),
            ("request_secs", t.request_secs),
        ] {
            if value == 0 {
                errors.push(format!("timeouts.{} must be greater than 0", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }

    pub fn admin_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_addr("admin.listen", &self.admin.listen)
    }

    pub fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_addr("proxy.http.listen", &self.proxy.http.listen)
    }

    pub fn tls_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_addr("proxy.tls.listen", &self.proxy.tls.listen)
    }
}
