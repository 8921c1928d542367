use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::defaults;
use crate::models::probe::{DnsTarget, ProbeMethod, ProbeTarget};
use crate::protection::exclusion::ExclusionList;

/// Upper bound for any per-probe timeout, in seconds.
pub const MAX_PROBE_TIMEOUT_SECS: f64 = 300.0;

/// Positive, finite and no longer than [`MAX_PROBE_TIMEOUT_SECS`].
pub fn valid_probe_timeout(secs: f64) -> bool {
    secs > 0.0 && secs <= MAX_PROBE_TIMEOUT_SECS
}

/// Top-level configuration for the NCSI resolver.
/// Deserializes from a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_server_config")]
    pub server: ServerConfig,

    #[serde(default = "defaults::default_connectivity_config")]
    pub connectivity: ConnectivityConfig,

    #[serde(default = "defaults::default_security_config")]
    pub security: SecurityConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,

    #[serde(default = "defaults::default_content_config")]
    pub content: ContentConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        Ok(settings)
    }

    /// Load the file if it exists, otherwise fall back to built-in defaults.
    ///
    /// An explicitly requested path that does not exist is an error; the
    /// default path is allowed to be absent.
    pub fn load_or_default(path: &str, explicit: bool) -> Result<Self> {
        if Path::new(path).exists() || explicit {
            return Self::load(path);
        }
        Ok(Self::default())
    }

    /// Reject values that would make the service misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be between 1 and 65535");
        }
        if self.server.max_connections == 0 {
            bail!("server.max_connections must be at least 1");
        }
        if !valid_probe_timeout(self.connectivity.timeout_secs) {
            bail!(
                "connectivity.timeout_secs must be greater than 0 and at most {}",
                MAX_PROBE_TIMEOUT_SECS
            );
        }
        if self.security.max_connections_per_ip == 0 {
            bail!("security.max_connections_per_ip must be at least 1");
        }
        if self.security.scan_threshold == 0 {
            bail!("security.scan_threshold must be at least 1");
        }
        if self.security.time_window_secs == 0 {
            bail!("security.time_window_secs must be at least 1");
        }
        if self.security.flush_every == 0 {
            bail!("security.flush_every must be at least 1");
        }
        ExclusionList::parse(&self.security.excluded_ips)
            .context("Invalid entry in security.excluded_ips")?;
        for url in self
            .connectivity
            .http_targets
            .iter()
            .chain(self.connectivity.https_targets.iter())
        {
            url.parse::<http::Uri>()
                .with_context(|| format!("Invalid probe URL: {}", url))?;
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: defaults::default_server_config(),
            connectivity: defaults::default_connectivity_config(),
            security: defaults::default_security_config(),
            logging: defaults::default_logging_config(),
            content: defaults::default_content_config(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_host")]
    pub host: String,

    #[serde(default = "defaults::default_port")]
    pub port: u16,

    /// When false every NCSI endpoint answers 200 without probing.
    #[serde(default = "defaults::default_verify_connectivity")]
    pub verify_connectivity: bool,

    #[serde(default = "defaults::default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "defaults::default_bind_retries")]
    pub bind_retries: u32,

    #[serde(default = "defaults::default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Written with the bound address once the listener answers.
    #[serde(default)]
    pub ready_file: Option<String>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Reachability probe targets and cache timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "defaults::default_ping_targets")]
    pub ping_targets: Vec<IpAddr>,

    #[serde(default = "defaults::default_dns_targets")]
    pub dns_targets: Vec<DnsTarget>,

    #[serde(default = "defaults::default_http_targets")]
    pub http_targets: Vec<String>,

    #[serde(default = "defaults::default_https_targets")]
    pub https_targets: Vec<String>,

    /// Per-probe timeout in seconds.
    #[serde(default = "defaults::default_probe_timeout_secs")]
    pub timeout_secs: f64,

    #[serde(default = "defaults::default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl ConnectivityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// All configured targets grouped by method, cheapest method first.
    pub fn targets(&self) -> Vec<(ProbeMethod, Vec<ProbeTarget>)> {
        vec![
            (
                ProbeMethod::Ping,
                self.ping_targets.iter().map(|ip| ProbeTarget::ping(*ip)).collect(),
            ),
            (
                ProbeMethod::Dns,
                self.dns_targets
                    .iter()
                    .map(|t| ProbeTarget::dns(&t.hostname, t.expected_ip))
                    .collect(),
            ),
            (
                ProbeMethod::Http,
                self.http_targets.iter().map(|u| ProbeTarget::http(u)).collect(),
            ),
            (
                ProbeMethod::Https,
                self.https_targets.iter().map(|u| ProbeTarget::https(u)).collect(),
            ),
        ]
    }
}

/// Abuse detection thresholds and connection-log persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "defaults::default_security_enabled")]
    pub enabled: bool,

    #[serde(default = "defaults::default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    #[serde(default = "defaults::default_time_window_secs")]
    pub time_window_secs: u64,

    #[serde(default = "defaults::default_scan_threshold")]
    pub scan_threshold: usize,

    /// IPs or CIDR ranges never tracked. `localhost` covers both loopbacks.
    #[serde(default = "defaults::default_excluded_ips")]
    pub excluded_ips: Vec<String>,

    /// Expire seen paths with the same window as request timestamps.
    #[serde(default)]
    pub windowed_scan_detection: bool,

    #[serde(default = "defaults::default_flush_every")]
    pub flush_every: usize,

    #[serde(default = "defaults::default_max_log_entries")]
    pub max_log_entries: usize,

    #[serde(default = "defaults::default_connection_log")]
    pub connection_log: String,
}

impl SecurityConfig {
    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_dir")]
    pub dir: String,

    /// Empty disables the per-request access log.
    #[serde(default = "defaults::default_access_log")]
    pub access_log: String,
}

/// Response payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "defaults::default_ncsi_text")]
    pub ncsi_text: String,

    #[serde(default)]
    pub redirect_html_path: Option<String>,
}
