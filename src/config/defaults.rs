use std::net::IpAddr;

use super::settings::{
    ConnectivityConfig, ContentConfig, LoggingConfig, SecurityConfig, ServerConfig,
};
use crate::models::probe::DnsTarget;

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_server_config() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
        verify_connectivity: default_verify_connectivity(),
        max_connections: default_max_connections(),
        bind_retries: default_bind_retries(),
        request_timeout_secs: default_request_timeout_secs(),
        ready_file: None,
    }
}

pub fn default_connectivity_config() -> ConnectivityConfig {
    ConnectivityConfig {
        ping_targets: default_ping_targets(),
        dns_targets: default_dns_targets(),
        http_targets: default_http_targets(),
        https_targets: default_https_targets(),
        timeout_secs: default_probe_timeout_secs(),
        check_interval_secs: default_check_interval_secs(),
    }
}

pub fn default_security_config() -> SecurityConfig {
    SecurityConfig {
        enabled: default_security_enabled(),
        max_connections_per_ip: default_max_connections_per_ip(),
        time_window_secs: default_time_window_secs(),
        scan_threshold: default_scan_threshold(),
        excluded_ips: default_excluded_ips(),
        windowed_scan_detection: false,
        flush_every: default_flush_every(),
        max_log_entries: default_max_log_entries(),
        connection_log: default_connection_log(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        dir: default_log_dir(),
        access_log: default_access_log(),
    }
}

pub fn default_content_config() -> ContentConfig {
    ContentConfig {
        ncsi_text: default_ncsi_text(),
        redirect_html_path: None,
    }
}

// ---------------------------------------------------------------------------
// ServerConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_port() -> u16 {
    80
}

pub fn default_verify_connectivity() -> bool {
    true
}

pub fn default_max_connections() -> usize {
    256
}

pub fn default_bind_retries() -> u32 {
    3
}

pub fn default_request_timeout_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// ConnectivityConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_ping_targets() -> Vec<IpAddr> {
    ["8.8.8.8", "1.1.1.1", "4.2.2.1"]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

pub fn default_dns_targets() -> Vec<DnsTarget> {
    vec![
        DnsTarget::new("www.google.com", None),
        DnsTarget::new("www.cloudflare.com", None),
    ]
}

pub fn default_http_targets() -> Vec<String> {
    vec![
        "http://www.gstatic.com/generate_204".to_string(),
        "http://connectivitycheck.platform.hicloud.com/generate_204".to_string(),
    ]
}

pub fn default_https_targets() -> Vec<String> {
    vec![
        "https://www.google.com".to_string(),
        "https://www.cloudflare.com".to_string(),
    ]
}

pub fn default_probe_timeout_secs() -> f64 {
    2.0
}

pub fn default_check_interval_secs() -> u64 {
    15
}

// ---------------------------------------------------------------------------
// SecurityConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_security_enabled() -> bool {
    true
}

pub fn default_max_connections_per_ip() -> usize {
    20
}

pub fn default_time_window_secs() -> u64 {
    60
}

pub fn default_scan_threshold() -> usize {
    5
}

pub fn default_excluded_ips() -> Vec<String> {
    vec![
        "127.0.0.1".to_string(),
        "::1".to_string(),
        "localhost".to_string(),
    ]
}

pub fn default_flush_every() -> usize {
    20
}

pub fn default_max_log_entries() -> usize {
    1000
}

pub fn default_connection_log() -> String {
    "logs/connections.json".to_string()
}

// ---------------------------------------------------------------------------
// LoggingConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_dir() -> String {
    "logs".to_string()
}

pub fn default_access_log() -> String {
    "logs/access.log".to_string()
}

// ---------------------------------------------------------------------------
// ContentConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_ncsi_text() -> String {
    "Microsoft Connect Test".to_string()
}
