use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reachability check method, ordered from cheapest to most expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Ping,
    Dns,
    Http,
    Https,
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMethod::Ping => write!(f, "ping"),
            ProbeMethod::Dns => write!(f, "dns"),
            ProbeMethod::Http => write!(f, "http"),
            ProbeMethod::Https => write!(f, "https"),
        }
    }
}

/// Hostname to resolve, optionally pinned to the address it must resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsTarget {
    pub hostname: String,
    #[serde(default)]
    pub expected_ip: Option<IpAddr>,
}

impl DnsTarget {
    pub fn new(hostname: &str, expected_ip: Option<IpAddr>) -> Self {
        Self {
            hostname: hostname.to_string(),
            expected_ip,
        }
    }
}

/// A single thing to probe. Immutable once loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Ping(IpAddr),
    Dns(DnsTarget),
    Http(String),
    Https(String),
}

impl ProbeTarget {
    pub fn ping(ip: IpAddr) -> Self {
        ProbeTarget::Ping(ip)
    }

    pub fn dns(hostname: &str, expected_ip: Option<IpAddr>) -> Self {
        ProbeTarget::Dns(DnsTarget::new(hostname, expected_ip))
    }

    pub fn http(url: &str) -> Self {
        ProbeTarget::Http(url.to_string())
    }

    pub fn https(url: &str) -> Self {
        ProbeTarget::Https(url.to_string())
    }

    pub fn method(&self) -> ProbeMethod {
        match self {
            ProbeTarget::Ping(_) => ProbeMethod::Ping,
            ProbeTarget::Dns(_) => ProbeMethod::Dns,
            ProbeTarget::Http(_) => ProbeMethod::Http,
            ProbeTarget::Https(_) => ProbeMethod::Https,
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Ping(ip) => write!(f, "{}", ip),
            ProbeTarget::Dns(t) => write!(f, "{}", t.hostname),
            ProbeTarget::Http(url) | ProbeTarget::Https(url) => write!(f, "{}", url),
        }
    }
}

/// What a successful probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDetail {
    EchoReply,
    Resolved(IpAddr),
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSuccess {
    pub latency: Duration,
    pub detail: ProbeDetail,
}

/// Why a probe did not prove reachability. Never fatal: it only degrades the
/// connectivity verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("DNS resolution error: {0}")]
    Resolution(String),

    #[error("IP mismatch: got {got}, expected {expected}")]
    AddressMismatch { expected: IpAddr, got: IpAddr },

    #[error("connection error: {0}")]
    Network(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP status code {0}")]
    HttpStatus(u16),

    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

impl ProbeFailure {
    /// Coarse failure bucket used in diagnostics output.
    pub fn category(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout(_) => "timeout",
            ProbeFailure::Socket(_) => "socket",
            ProbeFailure::Resolution(_) | ProbeFailure::AddressMismatch { .. } => "dns",
            ProbeFailure::Network(_) => "network",
            ProbeFailure::Tls(_) => "tls",
            ProbeFailure::HttpStatus(_) => "http_status",
            ProbeFailure::InvalidTarget(_) => "config",
        }
    }
}

pub type ProbeResult = Result<ProbeSuccess, ProbeFailure>;

/// Per-target outcome as reported by the diagnostics run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub method: ProbeMethod,
    pub target: String,
    pub success: bool,
    pub latency_ms: Option<f64>,
    pub resolved_ip: Option<IpAddr>,
    pub status_code: Option<u16>,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn from_result(target: &ProbeTarget, result: &ProbeResult) -> Self {
        let mut report = Self {
            method: target.method(),
            target: target.to_string(),
            success: result.is_ok(),
            latency_ms: None,
            resolved_ip: None,
            status_code: None,
            error_kind: None,
            error: None,
        };

        match result {
            Ok(success) => {
                report.latency_ms = Some(success.latency.as_secs_f64() * 1000.0);
                match success.detail {
                    ProbeDetail::EchoReply => {}
                    ProbeDetail::Resolved(ip) => report.resolved_ip = Some(ip),
                    ProbeDetail::Status(code) => report.status_code = Some(code),
                }
            }
            Err(failure) => {
                match failure {
                    ProbeFailure::HttpStatus(code) => report.status_code = Some(*code),
                    ProbeFailure::AddressMismatch { got, .. } => report.resolved_ip = Some(*got),
                    _ => {}
                }
                report.error_kind = Some(failure.category());
                report.error = Some(failure.to_string());
            }
        }

        report
    }
}
