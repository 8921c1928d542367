use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::settings::SecurityConfig;
use crate::models::observation::{
    Classification, ConnectionLogEntry, DetectorStats, SuspiciousClient, Verdict,
};
use crate::storage::connection_log::{ConnectionLog, JsonFileSink, PersistenceError};

use super::client_window::ClientWindow;
use super::exclusion::ExclusionList;

/// Thresholds applied to every tracked client.
#[derive(Debug, Clone, Copy)]
pub struct DetectorLimits {
    pub max_connections_per_ip: usize,
    pub time_window: Duration,
    pub scan_threshold: usize,
    pub windowed_scan_detection: bool,
}

impl From<&SecurityConfig> for DetectorLimits {
    fn from(config: &SecurityConfig) -> Self {
        Self {
            max_connections_per_ip: config.max_connections_per_ip,
            time_window: config.time_window(),
            scan_threshold: config.scan_threshold,
            windowed_scan_detection: config.windowed_scan_detection,
        }
    }
}

/// Per-client rate and path-diversity tracking.
///
/// Classification only: nothing here blocks or alters a response.
pub struct AbuseDetector {
    clients: DashMap<IpAddr, ClientWindow>,
    limits: DetectorLimits,
    exclusions: ExclusionList,
    log: Arc<ConnectionLog>,
}

impl AbuseDetector {
    pub fn new(limits: DetectorLimits, exclusions: ExclusionList, log: Arc<ConnectionLog>) -> Self {
        info!(
            max_connections_per_ip = limits.max_connections_per_ip,
            time_window_secs = limits.time_window.as_secs(),
            scan_threshold = limits.scan_threshold,
            windowed_scan_detection = limits.windowed_scan_detection,
            excluded = ?exclusions.entries(),
            "Abuse detector initialized"
        );
        Self {
            clients: DashMap::with_capacity(1024),
            limits,
            exclusions,
            log,
        }
    }

    /// Detector persisting its connection log as a JSON file.
    pub fn from_config(config: &SecurityConfig) -> anyhow::Result<Self> {
        let exclusions = ExclusionList::parse(&config.excluded_ips)?;
        let log = if config.connection_log.is_empty() {
            info!("Connection log persistence disabled");
            ConnectionLog::in_memory(config.max_log_entries)
        } else {
            let sink = JsonFileSink::new(&config.connection_log);
            let path = sink.path().display().to_string();
            let log = ConnectionLog::with_sink(Box::new(sink), config.max_log_entries, config.flush_every);
            if !log.is_empty() {
                info!(path, retained = log.len(), "Connection log restored");
            } else {
                info!(path, "Connection log file");
            }
            log
        };
        Ok(Self::new(DetectorLimits::from(config), exclusions, Arc::new(log)))
    }

    pub fn record(&self, ip: IpAddr, path: &str, method: &str, response_code: u16) -> Classification {
        self.record_at(ip, path, method, response_code, Instant::now())
    }

    /// Classify one request observed at `now`.
    pub fn record_at(
        &self,
        ip: IpAddr,
        path: &str,
        method: &str,
        response_code: u16,
        now: Instant,
    ) -> Classification {
        let ip = ip.to_canonical();
        if self.exclusions.contains(ip) {
            debug!(client_ip = %ip, path, "Excluded client, not tracked");
            return Classification::Excluded;
        }

        let verdict = {
            let mut window = self.clients.entry(ip).or_default();
            window.prune(now, self.limits.time_window, self.limits.windowed_scan_detection);
            window.record(now, path);

            let connection_count = window.request_count();
            let unique_paths = window.unique_paths();
            Verdict {
                rate_limited: connection_count >= self.limits.max_connections_per_ip,
                scanning: unique_paths >= self.limits.scan_threshold,
                connection_count,
                unique_paths,
            }
        };

        if verdict.is_suspicious() {
            warn!(
                target: "security",
                client_ip = %ip,
                method,
                path,
                response_code,
                rate_limited = verdict.rate_limited,
                scanning = verdict.scanning,
                connection_count = verdict.connection_count,
                unique_paths = verdict.unique_paths,
                "{} - {} - {} {} - {} req/{}s, {} unique paths",
                verdict.labels().join(", "),
                ip,
                method,
                path,
                verdict.connection_count,
                self.limits.time_window.as_secs(),
                verdict.unique_paths
            );
        }

        self.log.append(ConnectionLogEntry::new(
            Utc::now(),
            ip,
            path,
            method,
            response_code,
            &verdict,
        ));

        Classification::Tracked(verdict)
    }

    /// Drop clients with no request inside the window. Returns how many.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.clients.len();
        let window = self.limits.time_window;
        let windowed = self.limits.windowed_scan_detection;
        self.clients.retain(|_, client| {
            client.prune(now, window, windowed);
            !client.is_idle()
        });
        before.saturating_sub(self.clients.len())
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> DetectorStats {
        let mut total_connections = 0;
        let mut suspicious_ips = Vec::new();

        for entry in self.clients.iter() {
            let connection_count = entry.value().count_in_window(now, self.limits.time_window);
            let unique_paths = entry.value().unique_paths();
            total_connections += connection_count;

            let rate_limited = connection_count >= self.limits.max_connections_per_ip;
            let scanning = unique_paths >= self.limits.scan_threshold;
            if rate_limited || scanning {
                suspicious_ips.push(SuspiciousClient {
                    ip: *entry.key(),
                    connection_count,
                    unique_paths,
                    rate_limited,
                    scanning,
                });
            }
        }
        suspicious_ips.sort_by(|a, b| b.connection_count.cmp(&a.connection_count));

        DetectorStats {
            active_ips: self.clients.len(),
            total_connections,
            suspicious_ips,
            excluded: self.exclusions.entries().to_vec(),
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<ConnectionLogEntry> {
        self.log.recent(limit)
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.log.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AbuseDetector {
        detector_with(false)
    }

    fn detector_with(windowed: bool) -> AbuseDetector {
        let limits = DetectorLimits {
            max_connections_per_ip: 20,
            time_window: Duration::from_secs(60),
            scan_threshold: 5,
            windowed_scan_detection: windowed,
        };
        let exclusions = ExclusionList::parse(&[
            "127.0.0.1".to_string(),
            "::1".to_string(),
            "localhost".to_string(),
        ])
        .unwrap();
        AbuseDetector::new(limits, exclusions, Arc::new(ConnectionLog::in_memory(1000)))
    }

    fn client() -> IpAddr {
        "192.168.1.50".parse().unwrap()
    }

    fn verdict(c: Classification) -> Verdict {
        match c {
            Classification::Tracked(v) => v,
            Classification::Excluded => panic!("client should be tracked"),
        }
    }

    #[test]
    fn test_rate_limit_boundary() {
        let d = detector();
        let t0 = Instant::now();
        for i in 0..19 {
            let v = verdict(d.record_at(client(), "/ncsi.txt", "GET", 200, t0 + Duration::from_millis(i)));
            assert!(!v.rate_limited, "request {} flagged early", i + 1);
        }
        let v = verdict(d.record_at(client(), "/ncsi.txt", "GET", 200, t0 + Duration::from_millis(19)));
        assert!(v.rate_limited);
        assert_eq!(v.connection_count, 20);
        assert!(!v.scanning);
    }

    #[test]
    fn test_burst_flags_twentieth_and_later() {
        let d = detector();
        let t0 = Instant::now();
        let flags: Vec<bool> = (0..25)
            .map(|i| {
                verdict(d.record_at(client(), "/connecttest.txt", "GET", 200, t0 + Duration::from_millis(i * 10)))
                    .rate_limited
            })
            .collect();
        assert!(flags[..19].iter().all(|f| !f));
        assert!(flags[19..].iter().all(|f| *f));
        assert_eq!(d.recent(100).len(), 25);
    }

    #[test]
    fn test_scanning_on_fifth_distinct_path() {
        let d = detector();
        let t0 = Instant::now();
        let paths = ["/a", "/b", "/c", "/d", "/e"];
        let mut last = None;
        for (i, path) in paths.iter().enumerate() {
            let v = verdict(d.record_at(client(), path, "GET", 404, t0 + Duration::from_secs(i as u64)));
            if i < 4 {
                assert!(!v.scanning);
            }
            last = Some(v);
        }
        let last = last.unwrap();
        assert!(last.scanning);
        assert_eq!(last.unique_paths, 5);
        assert!(!last.rate_limited);
    }

    #[test]
    fn test_loopback_is_never_tracked() {
        let d = detector();
        for _ in 0..100 {
            assert_eq!(d.record("127.0.0.1".parse().unwrap(), "/x", "GET", 404), Classification::Excluded);
            assert_eq!(d.record("::1".parse().unwrap(), "/y", "GET", 404), Classification::Excluded);
        }
        assert_eq!(d.stats().active_ips, 0);
        assert!(d.recent(10).is_empty());
    }

    #[test]
    fn test_old_requests_leave_the_window() {
        let d = detector();
        let t0 = Instant::now();
        for i in 0..19 {
            d.record_at(client(), "/ncsi.txt", "GET", 200, t0 + Duration::from_millis(i));
        }
        let later = t0 + Duration::from_secs(61);
        let v = verdict(d.record_at(client(), "/ncsi.txt", "GET", 200, later));
        assert_eq!(v.connection_count, 1);
        assert!(!v.rate_limited);
    }

    #[test]
    fn test_paths_persist_across_window_by_default() {
        let d = detector();
        let t0 = Instant::now();
        for (i, path) in ["/a", "/b", "/c", "/d"].iter().enumerate() {
            d.record_at(client(), path, "GET", 404, t0 + Duration::from_secs(i as u64 * 50));
        }
        let v = verdict(d.record_at(client(), "/e", "GET", 404, t0 + Duration::from_secs(190)));
        assert!(v.scanning);
    }

    #[test]
    fn test_windowed_scan_detection() {
        let d = detector_with(true);
        let t0 = Instant::now();
        for (i, path) in ["/a", "/b", "/c", "/d"].iter().enumerate() {
            d.record_at(client(), path, "GET", 404, t0 + Duration::from_secs(i as u64 * 50));
        }
        let v = verdict(d.record_at(client(), "/e", "GET", 404, t0 + Duration::from_secs(190)));
        assert!(!v.scanning);
        assert_eq!(v.unique_paths, 2);
    }

    #[test]
    fn test_clients_are_independent() {
        let d = detector();
        let t0 = Instant::now();
        for i in 0..20 {
            d.record_at(client(), "/ncsi.txt", "GET", 200, t0 + Duration::from_millis(i));
        }
        let other: IpAddr = "10.1.2.3".parse().unwrap();
        let v = verdict(d.record_at(other, "/ncsi.txt", "GET", 200, t0));
        assert_eq!(v.connection_count, 1);
        assert!(!v.rate_limited);
    }

    #[test]
    fn test_evict_idle_clients() {
        let d = detector();
        let t0 = Instant::now();
        d.record_at(client(), "/ncsi.txt", "GET", 200, t0);
        d.record_at("10.1.2.3".parse().unwrap(), "/ncsi.txt", "GET", 200, t0 + Duration::from_secs(30));

        assert_eq!(d.evict_idle_at(t0 + Duration::from_secs(61)), 1);
        assert_eq!(d.stats_at(t0 + Duration::from_secs(61)).active_ips, 1);
        assert_eq!(d.evict_idle_at(t0 + Duration::from_secs(91)), 1);
    }

    #[test]
    fn test_stats_report_suspicious_clients() {
        let d = detector();
        let t0 = Instant::now();
        for (i, path) in ["/a", "/b", "/c", "/d", "/e"].iter().enumerate() {
            d.record_at(client(), path, "GET", 404, t0 + Duration::from_millis(i as u64));
        }
        d.record_at("10.1.2.3".parse().unwrap(), "/ncsi.txt", "GET", 200, t0);

        let stats = d.stats_at(t0 + Duration::from_secs(1));
        assert_eq!(stats.active_ips, 2);
        assert_eq!(stats.total_connections, 6);
        assert_eq!(stats.suspicious_ips.len(), 1);
        assert_eq!(stats.suspicious_ips[0].ip, client());
        assert!(stats.suspicious_ips[0].scanning);
        assert_eq!(stats.excluded.len(), 3);
    }

    #[test]
    fn test_log_entries_carry_verdict() {
        let d = detector();
        d.record(client(), "/wp-login.php", "POST", 404);
        let entries = d.recent(1);
        assert_eq!(entries[0].path, "/wp-login.php");
        assert_eq!(entries[0].method, "POST");
        assert_eq!(entries[0].response_code, 404);
        assert_eq!(entries[0].connection_count, 1);
    }

    #[test]
    fn test_mapped_address_shares_window() {
        let d = detector();
        d.record("::ffff:192.168.1.50".parse().unwrap(), "/a", "GET", 404);
        let v = verdict(d.record(client(), "/b", "GET", 404));
        assert_eq!(v.connection_count, 2);
    }
}
