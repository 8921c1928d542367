use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::models::probe::{ProbeMethod, ProbeReport, ProbeTarget};

use super::prober::{NetworkProber, Prober};

/// Endpoints the local service is expected to answer.
pub const LOCAL_ENDPOINTS: [&str; 3] = ["/connecttest.txt", "/ncsi.txt", "/redirect"];

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct MethodReport {
    pub method: ProbeMethod,
    /// At least one target of this method succeeded.
    pub success: bool,
    pub results: Vec<ProbeReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointCheck {
    pub path: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub content_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalServiceReport {
    pub host: String,
    pub port: u16,
    pub port_open: bool,
    pub success: bool,
    pub paths: Vec<EndpointCheck>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Summary {
    pub icmp: bool,
    pub dns: bool,
    pub http: bool,
    pub https: bool,
    pub local_service: Option<bool>,
    pub all_tests_success: bool,
    pub internet_connectivity: bool,
}

impl Summary {
    pub fn from_parts(methods: &[MethodReport], local: Option<&LocalServiceReport>) -> Self {
        let ok = |m: ProbeMethod| methods.iter().any(|r| r.method == m && r.success);
        let icmp = ok(ProbeMethod::Ping);
        let dns = ok(ProbeMethod::Dns);
        let http = ok(ProbeMethod::Http);
        let https = ok(ProbeMethod::Https);
        let local_service = local.map(|l| l.success);

        Self {
            icmp,
            dns,
            http,
            https,
            local_service,
            all_tests_success: icmp && dns && http && https && local_service.unwrap_or(true),
            internet_connectivity: icmp || dns || (http && https),
        }
    }
}

/// Full diagnostics run: every method, every target, plus the local service.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub methods: Vec<MethodReport>,
    pub local_service: Option<LocalServiceReport>,
    pub summary: Summary,
}

impl DiagnosticsReport {
    pub fn new(methods: Vec<MethodReport>, local_service: Option<LocalServiceReport>) -> Self {
        let summary = Summary::from_parts(&methods, local_service.as_ref());
        Self {
            generated_at: Utc::now(),
            methods,
            local_service,
            summary,
        }
    }

    /// Human readable report with recommendations.
    pub fn format(&self, verbose: bool) -> String {
        let s = &self.summary;
        let mut out = String::new();

        let _ = writeln!(out, "Network Diagnostics Report");
        let _ = writeln!(out, "==========================");
        let _ = writeln!(out, "Generated: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(
            out,
            "\nInternet Connectivity: {}",
            if s.internet_connectivity { "AVAILABLE" } else { "NOT AVAILABLE" }
        );

        for report in &self.methods {
            let _ = writeln!(out, "\n{}: {}", heading(report.method), outcome(report.success));
            if !verbose {
                continue;
            }
            for r in &report.results {
                let mut line = format!("  {}: {}", r.target, outcome(r.success));
                let mut details = Vec::new();
                if let Some(ip) = r.resolved_ip {
                    details.push(format!("resolved to {}", ip));
                }
                if let Some(code) = r.status_code {
                    details.push(format!("status {}", code));
                }
                if let Some(ms) = r.latency_ms {
                    details.push(format!("{:.1} ms", ms));
                }
                if !details.is_empty() {
                    let _ = write!(line, " ({})", details.join(", "));
                }
                if let Some(ref err) = r.error {
                    let _ = write!(line, " - {}", err);
                }
                let _ = writeln!(out, "{}", line);
            }
        }

        if let Some(ref local) = self.local_service {
            let _ = writeln!(
                out,
                "\nLocal NCSI Service ({}:{}): {}",
                local.host,
                local.port,
                outcome(local.success)
            );
            let _ = writeln!(out, "  Port Open: {}", if local.port_open { "YES" } else { "NO" });
            if verbose {
                for check in &local.paths {
                    let mut line = format!("  {}: {}", check.path, outcome(check.success));
                    if let Some(ref err) = check.error {
                        let _ = write!(line, " - {}", err);
                    }
                    let _ = writeln!(out, "{}", line);
                    if let Some(ref preview) = check.content_preview {
                        let _ = writeln!(out, "    Content Preview: {}", preview);
                    }
                }
            }
            if let Some(ref err) = local.error {
                let _ = writeln!(out, "  Error: {}", err);
            }
        }

        let _ = writeln!(out, "\nAnalysis & Recommendations:");
        for line in self.recommendations() {
            let _ = writeln!(out, "  {}", line);
        }
        out
    }

    pub fn recommendations(&self) -> Vec<&'static str> {
        let s = &self.summary;
        let mut lines = Vec::new();

        if s.all_tests_success {
            lines.push("All tests passed.");
            return lines;
        }

        if s.internet_connectivity {
            lines.push("Internet connectivity is available, but some tests failed.");
            if !s.icmp {
                lines.push("- ICMP echo is blocked. This is common on some networks and not critical.");
            }
            if !s.dns {
                lines.push("- DNS resolution issues detected. Check the configured DNS servers.");
            }
            if !s.http || !s.https {
                lines.push("- HTTP/HTTPS connectivity issues. Check proxy settings or firewall rules.");
            }
        } else {
            lines.push("No Internet connectivity detected. Check the network connection.");
            if !s.icmp && !s.dns {
                lines.push("- Basic network connectivity is failing. Check the physical link and router.");
            }
        }

        if let Some(ref local) = self.local_service {
            if !local.success {
                if local.port_open {
                    lines.push("- The local NCSI service is listening but not answering correctly. Check its configuration.");
                } else {
                    lines.push("- The local NCSI service port is not reachable. Check that the service is running and the firewall allows it.");
                }
            }
        }
        lines
    }
}

fn heading(method: ProbeMethod) -> &'static str {
    match method {
        ProbeMethod::Ping => "ICMP (Ping)",
        ProbeMethod::Dns => "DNS Resolution",
        ProbeMethod::Http => "HTTP Connectivity",
        ProbeMethod::Https => "HTTPS Connectivity",
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "SUCCESS"
    } else {
        "FAILED"
    }
}

/// Where the local service is expected to listen and what it should serve.
#[derive(Debug, Clone)]
pub struct LocalServiceTarget {
    pub host: String,
    pub port: u16,
    pub ncsi_text: String,
}

pub struct Diagnostics {
    prober: Arc<dyn Prober>,
    http: NetworkProber,
    timeout: Duration,
}

impl Diagnostics {
    pub fn new(prober: Arc<dyn Prober>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            prober,
            http: NetworkProber::new()?,
            timeout,
        })
    }

    /// Probe every target of one method concurrently.
    pub async fn run_method(&self, method: ProbeMethod, targets: &[ProbeTarget]) -> MethodReport {
        let probes = targets.iter().map(|target| async move {
            let result = self.prober.probe(target, self.timeout).await;
            ProbeReport::from_result(target, &result)
        });
        let results = join_all(probes).await;
        let success = results.iter().any(|r| r.success);

        debug!(method = %method, success, targets = results.len(), "Diagnostics method finished");
        MethodReport {
            method,
            success,
            results,
        }
    }

    /// Check that the local service accepts connections and serves every
    /// NCSI endpoint.
    pub async fn check_local_service(&self, target: &LocalServiceTarget) -> LocalServiceReport {
        let mut report = LocalServiceReport {
            host: target.host.clone(),
            port: target.port,
            port_open: false,
            success: false,
            paths: Vec::new(),
            error: None,
        };

        let connect = TcpStream::connect((target.host.as_str(), target.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => report.port_open = true,
            Ok(Err(e)) => {
                report.error = Some(format!("Port {} is not open on {}: {}", target.port, target.host, e));
                return report;
            }
            Err(_) => {
                report.error = Some(format!("Connecting to {}:{} timed out", target.host, target.port));
                return report;
            }
        }

        let authority = match target.host.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V6(v6)) => format!("[{}]:{}", v6, target.port),
            _ => format!("{}:{}", target.host, target.port),
        };

        for path in LOCAL_ENDPOINTS {
            let check = self.check_endpoint(&authority, path, &target.ncsi_text).await;
            report.paths.push(check);
        }
        report.success = report.paths.iter().all(|c| c.success);
        report
    }

    async fn check_endpoint(&self, authority: &str, path: &str, ncsi_text: &str) -> EndpointCheck {
        let mut check = EndpointCheck {
            path: path.to_string(),
            success: false,
            status_code: None,
            content_length: None,
            content_preview: None,
            error: None,
        };

        let url = format!("http://{}{}", authority, path);
        let response = match self.http.fetch(&url, false, self.timeout, true).await {
            Ok(response) => response,
            Err(failure) => {
                check.error = Some(failure.to_string());
                return check;
            }
        };

        check.status_code = Some(response.status);
        check.content_length = Some(response.body.len());

        if response.status != 200 {
            check.error = Some(format!("Status code {}", response.status));
        } else if path == "/redirect" {
            check.success = true;
        } else if response.body.as_ref() == ncsi_text.as_bytes() {
            check.success = true;
        } else {
            check.error = Some("Unexpected content".to_string());
            check.content_preview = Some(
                String::from_utf8_lossy(&response.body)
                    .chars()
                    .take(PREVIEW_CHARS)
                    .collect(),
            );
        }
        check
    }

    /// Run everything. Methods run one after another, targets within a
    /// method in parallel.
    pub async fn run(
        &self,
        plan: &[(ProbeMethod, Vec<ProbeTarget>)],
        local: Option<&LocalServiceTarget>,
    ) -> DiagnosticsReport {
        let mut methods = Vec::with_capacity(plan.len());
        for (method, targets) in plan {
            methods.push(self.run_method(*method, targets).await);
        }

        let local_service = match local {
            Some(target) => Some(self.check_local_service(target).await),
            None => None,
        };

        let report = DiagnosticsReport::new(methods, local_service);
        info!(
            internet_connectivity = report.summary.internet_connectivity,
            all_tests_success = report.summary.all_tests_success,
            "Diagnostics finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::probe::{ProbeDetail, ProbeFailure, ProbeResult, ProbeSuccess};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Succeeds for targets whose display form contains "ok".
    struct ScriptedProber;

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
            if target.to_string().contains("ok") {
                Ok(ProbeSuccess {
                    latency: Duration::from_millis(5),
                    detail: ProbeDetail::Status(204),
                })
            } else {
                Err(ProbeFailure::Timeout(timeout))
            }
        }
    }

    fn diagnostics() -> Diagnostics {
        Diagnostics::new(Arc::new(ScriptedProber), Duration::from_secs(2)).unwrap()
    }

    fn method(method: ProbeMethod, success: bool) -> MethodReport {
        MethodReport {
            method,
            success,
            results: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_method_succeeds_if_any_target_does() {
        let report = diagnostics()
            .run_method(
                ProbeMethod::Http,
                &[ProbeTarget::http("http://down.test/"), ProbeTarget::http("http://ok.test/")],
            )
            .await;
        assert!(report.success);
        assert_eq!(report.results.len(), 2);
        assert!(!report.results[0].success);
        assert_eq!(report.results[0].error_kind, Some("timeout"));
        assert_eq!(report.results[1].status_code, Some(204));
    }

    #[tokio::test]
    async fn test_method_without_targets_fails() {
        let report = diagnostics().run_method(ProbeMethod::Dns, &[]).await;
        assert!(!report.success);
    }

    #[test]
    fn test_internet_connectivity_rules() {
        let only_http = [
            method(ProbeMethod::Ping, false),
            method(ProbeMethod::Dns, false),
            method(ProbeMethod::Http, true),
            method(ProbeMethod::Https, false),
        ];
        assert!(!Summary::from_parts(&only_http, None).internet_connectivity);

        let web = [
            method(ProbeMethod::Ping, false),
            method(ProbeMethod::Dns, false),
            method(ProbeMethod::Http, true),
            method(ProbeMethod::Https, true),
        ];
        assert!(Summary::from_parts(&web, None).internet_connectivity);

        let dns = [method(ProbeMethod::Dns, true)];
        let summary = Summary::from_parts(&dns, None);
        assert!(summary.internet_connectivity);
        assert!(!summary.all_tests_success);
    }

    #[test]
    fn test_report_recommendations() {
        let methods = vec![
            method(ProbeMethod::Ping, false),
            method(ProbeMethod::Dns, true),
            method(ProbeMethod::Http, true),
            method(ProbeMethod::Https, true),
        ];
        let report = DiagnosticsReport::new(methods, None);
        let text = report.format(false);
        assert!(text.contains("Internet Connectivity: AVAILABLE"));
        assert!(text.contains("ICMP (Ping): FAILED"));
        assert!(text.contains("ICMP echo is blocked"));
        assert!(!text.contains("DNS resolution issues"));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = DiagnosticsReport::new(vec![method(ProbeMethod::Ping, true)], None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["summary"]["icmp"], true);
        assert_eq!(json["methods"][0]["method"], "ping");
        assert!(json["local_service"].is_null());
    }

    /// Minimal NCSI responder answering `count` connections.
    async fn fake_local_service(body: &'static str, count: usize) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // One extra accept for the port-open check.
            for _ in 0..=count {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_local_service_healthy() {
        let port = fake_local_service("Microsoft Connect Test", 3).await;
        let target = LocalServiceTarget {
            host: "127.0.0.1".to_string(),
            port,
            ncsi_text: "Microsoft Connect Test".to_string(),
        };
        let report = diagnostics().check_local_service(&target).await;
        assert!(report.port_open);
        assert!(report.success, "{:?}", report);
        assert_eq!(report.paths.len(), 3);
        assert_eq!(report.paths[0].content_length, Some(22));
    }

    #[tokio::test]
    async fn test_local_service_wrong_payload() {
        let port = fake_local_service("It works!", 3).await;
        let target = LocalServiceTarget {
            host: "127.0.0.1".to_string(),
            port,
            ncsi_text: "Microsoft Connect Test".to_string(),
        };
        let report = diagnostics().check_local_service(&target).await;
        assert!(report.port_open);
        assert!(!report.success);
        assert_eq!(report.paths[0].error.as_deref(), Some("Unexpected content"));
        assert_eq!(report.paths[0].content_preview.as_deref(), Some("It works!"));
        // /redirect only needs a 200.
        assert!(report.paths[2].success);
    }

    #[tokio::test]
    async fn test_local_service_port_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = LocalServiceTarget {
            host: "127.0.0.1".to_string(),
            port,
            ncsi_text: "Microsoft Connect Test".to_string(),
        };
        let report = diagnostics().check_local_service(&target).await;
        assert!(!report.port_open);
        assert!(report.paths.is_empty());
        assert!(report.error.is_some());

        let full = DiagnosticsReport::new(vec![method(ProbeMethod::Ping, true)], Some(report));
        assert!(full
            .recommendations()
            .iter()
            .any(|l| l.contains("port is not reachable")));
    }
}
