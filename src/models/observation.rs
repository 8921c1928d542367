use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of classifying one request from a tracked client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub rate_limited: bool,
    pub scanning: bool,
    /// Requests from the client inside the current window, this one included.
    pub connection_count: usize,
    pub unique_paths: usize,
}

impl Verdict {
    pub fn is_suspicious(&self) -> bool {
        self.rate_limited || self.scanning
    }

    /// Labels for the security log, in a fixed order.
    pub fn labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::with_capacity(2);
        if self.rate_limited {
            labels.push("RATE LIMITED");
        }
        if self.scanning {
            labels.push("SCANNING");
        }
        labels
    }
}

/// Result of `AbuseDetector::record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Loopback or allowlisted client; nothing was tracked.
    Excluded,
    Tracked(Verdict),
}

/// One observed request as persisted in the connection log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub ip: IpAddr,
    pub path: String,
    pub method: String,
    pub response_code: u16,
    pub rate_limited: bool,
    pub scanning: bool,
    pub connection_count: usize,
    pub unique_paths: usize,
}

impl ConnectionLogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        ip: IpAddr,
        path: &str,
        method: &str,
        response_code: u16,
        verdict: &Verdict,
    ) -> Self {
        Self {
            timestamp,
            ip,
            path: path.to_string(),
            method: method.to_string(),
            response_code,
            rate_limited: verdict.rate_limited,
            scanning: verdict.scanning,
            connection_count: verdict.connection_count,
            unique_paths: verdict.unique_paths,
        }
    }
}

/// Snapshot of one client currently over a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousClient {
    pub ip: IpAddr,
    pub connection_count: usize,
    pub unique_paths: usize,
    pub rate_limited: bool,
    pub scanning: bool,
}

/// Detector-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStats {
    pub active_ips: usize,
    pub total_connections: usize,
    pub suspicious_ips: Vec<SuspiciousClient>,
    pub excluded: Vec<String>,
}
