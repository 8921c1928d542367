use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, USER_AGENT};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::models::probe::{
    DnsTarget, ProbeDetail, ProbeFailure, ProbeResult, ProbeSuccess, ProbeTarget,
};

use super::icmp;

const PROBE_USER_AGENT: &str = concat!("ncsi-resolver/", env!("CARGO_PKG_VERSION"));

/// Anything that can run a single reachability probe.
///
/// Implementations must never panic or block past `timeout`; every problem is
/// reported as a [`ProbeFailure`].
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult;
}

/// Status line and (optionally) body of a plain GET.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Real network prober: ICMP echo, system resolver, HTTP/1.1 and HTTPS.
pub struct NetworkProber {
    tls: TlsConnector,
}

impl NetworkProber {
    pub fn new() -> anyhow::Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions for HTTPS probes")?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// ICMP echo; any reply before the deadline counts.
    pub async fn probe_ping(&self, ip: IpAddr, timeout: Duration) -> ProbeResult {
        let latency = icmp::ping(ip, timeout).await?;
        Ok(ProbeSuccess {
            latency,
            detail: ProbeDetail::EchoReply,
        })
    }

    /// Resolve through the system resolver. With an expected address the
    /// probe passes when any returned record matches it.
    pub async fn probe_dns(&self, target: &DnsTarget, timeout: Duration) -> ProbeResult {
        let start = Instant::now();
        let lookup = tokio::net::lookup_host((target.hostname.as_str(), 0u16));

        let addrs: Vec<IpAddr> = match tokio::time::timeout(timeout, lookup).await {
            Err(_) => return Err(ProbeFailure::Timeout(timeout)),
            Ok(Err(e)) => return Err(ProbeFailure::Resolution(e.to_string())),
            Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
        };

        let first = addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ProbeFailure::Resolution("no addresses returned".to_string()))?;

        let resolved = match target.expected_ip {
            Some(expected) if addrs.contains(&expected) => expected,
            Some(expected) => {
                warn!(
                    hostname = %target.hostname,
                    resolved = %first,
                    expected = %expected,
                    "DNS lookup returned an unexpected address"
                );
                return Err(ProbeFailure::AddressMismatch { expected, got: first });
            }
            None => first,
        };

        Ok(ProbeSuccess {
            latency: start.elapsed(),
            detail: ProbeDetail::Resolved(resolved),
        })
    }

    pub async fn probe_http(&self, url: &str, timeout: Duration) -> ProbeResult {
        self.probe_url(url, false, timeout).await
    }

    /// Same as [`probe_http`](Self::probe_http) but the certificate chain must
    /// verify against the bundled web PKI roots.
    pub async fn probe_https(&self, url: &str, timeout: Duration) -> ProbeResult {
        self.probe_url(url, true, timeout).await
    }

    async fn probe_url(&self, url: &str, secure: bool, timeout: Duration) -> ProbeResult {
        let start = Instant::now();
        let response = self.fetch(url, secure, timeout, false).await?;
        if (200..400).contains(&response.status) {
            Ok(ProbeSuccess {
                latency: start.elapsed(),
                detail: ProbeDetail::Status(response.status),
            })
        } else {
            Err(ProbeFailure::HttpStatus(response.status))
        }
    }

    /// Issue one GET without following redirects.
    pub async fn fetch(
        &self,
        url: &str,
        secure: bool,
        timeout: Duration,
        read_body: bool,
    ) -> Result<FetchedResponse, ProbeFailure> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ProbeFailure::InvalidTarget(format!("{}: {}", url, e)))?;

        let expected_scheme = if secure { "https" } else { "http" };
        if uri.scheme_str() != Some(expected_scheme) {
            return Err(ProbeFailure::InvalidTarget(format!(
                "{} is not an {} URL",
                url, expected_scheme
            )));
        }

        match tokio::time::timeout(timeout, self.exchange(&uri, secure, read_body)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeFailure::Timeout(timeout)),
        }
    }

    async fn exchange(
        &self,
        uri: &Uri,
        secure: bool,
        read_body: bool,
    ) -> Result<FetchedResponse, ProbeFailure> {
        let host = uri
            .host()
            .ok_or_else(|| ProbeFailure::InvalidTarget(format!("{} has no host", uri)))?;
        // IPv6 literals come back bracketed from `Uri::host`.
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| host.clone());
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, authority)
            .header(USER_AGENT, PROBE_USER_AGENT)
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeFailure::InvalidTarget(e.to_string()))?;

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ProbeFailure::Network(e.to_string()))?;

        if secure {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| ProbeFailure::InvalidTarget(format!("{}: {}", host, e)))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| ProbeFailure::Tls(e.to_string()))?;
            send_request(TokioIo::new(tls_stream), request, read_body).await
        } else {
            send_request(TokioIo::new(stream), request, read_body).await
        }
    }
}

/// Drive an HTTP/1.1 exchange on an established stream. The connection is
/// polled in the same task so dropping this future closes the socket.
async fn send_request<T>(
    io: T,
    request: Request<Empty<Bytes>>,
    read_body: bool,
) -> Result<FetchedResponse, ProbeFailure>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeFailure::Network(e.to_string()))?;

    let exchange = async move {
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProbeFailure::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = if read_body {
            response
                .into_body()
                .collect()
                .await
                .map_err(|e| ProbeFailure::Network(e.to_string()))?
                .to_bytes()
        } else {
            Bytes::new()
        };
        Ok::<_, ProbeFailure>(FetchedResponse { status, body })
    };

    tokio::pin!(conn);
    tokio::pin!(exchange);

    tokio::select! {
        biased;
        result = &mut exchange => result,
        closed = &mut conn => match closed {
            Err(e) => Err(ProbeFailure::Network(e.to_string())),
            Ok(()) => exchange.await,
        },
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
        let result = match target {
            ProbeTarget::Ping(ip) => self.probe_ping(*ip, timeout).await,
            ProbeTarget::Dns(dns) => self.probe_dns(dns, timeout).await,
            ProbeTarget::Http(url) => self.probe_http(url, timeout).await,
            ProbeTarget::Https(url) => self.probe_https(url, timeout).await,
        };

        if let Err(ref failure) = result {
            debug!(
                method = %target.method(),
                target = %target,
                kind = failure.category(),
                error = %failure,
                "Probe failed"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const NO_CONTENT: &[u8] =
        b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const SERVER_ERROR: &[u8] =
        b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const REDIRECT: &[u8] =
        b"HTTP/1.1 302 Found\r\nLocation: /login\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    /// Accept one connection, read the request head and answer with `response`.
    async fn serve_once(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    /// Accept one connection and never answer.
    async fn serve_silent() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(stream);
            }
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_http_204_is_success() {
        let prober = NetworkProber::new().unwrap();
        let addr = serve_once(NO_CONTENT).await;
        let result = prober
            .probe_http(&format!("http://{}/generate_204", addr), Duration::from_secs(2))
            .await;
        let success = result.unwrap();
        assert_eq!(success.detail, ProbeDetail::Status(204));
    }

    #[tokio::test]
    async fn test_http_redirect_is_success() {
        let prober = NetworkProber::new().unwrap();
        let addr = serve_once(REDIRECT).await;
        let result = prober
            .probe_http(&format!("http://{}/", addr), Duration::from_secs(2))
            .await;
        assert_eq!(result.unwrap().detail, ProbeDetail::Status(302));
    }

    #[tokio::test]
    async fn test_http_500_is_status_failure() {
        let prober = NetworkProber::new().unwrap();
        let addr = serve_once(SERVER_ERROR).await;
        let result = prober
            .probe_http(&format!("http://{}/", addr), Duration::from_secs(2))
            .await;
        assert_eq!(result, Err(ProbeFailure::HttpStatus(500)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_failure() {
        let prober = NetworkProber::new().unwrap();
        let addr = closed_port().await;
        let result = prober
            .probe_http(&format!("http://{}/", addr), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(ProbeFailure::Network(_))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let prober = NetworkProber::new().unwrap();
        let addr = serve_silent().await;
        let result = prober
            .probe_http(&format!("http://{}/", addr), Duration::from_millis(200))
            .await;
        assert_eq!(result, Err(ProbeFailure::Timeout(Duration::from_millis(200))));
    }

    #[tokio::test]
    async fn test_https_against_plain_server_is_tls_failure() {
        let prober = NetworkProber::new().unwrap();
        let addr = serve_once(NO_CONTENT).await;
        let result = prober
            .probe_https(&format!("https://{}/", addr), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(ProbeFailure::Tls(_))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_scheme_mismatch_is_invalid_target() {
        let prober = NetworkProber::new().unwrap();
        let result = prober
            .probe_https("http://example.invalid/", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ProbeFailure::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_fetch_reads_body() {
        const BODY: &[u8] =
            b"HTTP/1.1 200 OK\r\nContent-Length: 22\r\nConnection: close\r\n\r\nMicrosoft Connect Test";
        let prober = NetworkProber::new().unwrap();
        let addr = serve_once(BODY).await;
        let response = prober
            .fetch(&format!("http://{}/ncsi.txt", addr), false, Duration::from_secs(2), true)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"Microsoft Connect Test");
    }

    #[tokio::test]
    async fn test_dns_localhost_resolves() {
        let prober = NetworkProber::new().unwrap();
        let result = prober
            .probe_dns(&DnsTarget::new("localhost", None), Duration::from_secs(2))
            .await;
        match result.unwrap().detail {
            ProbeDetail::Resolved(ip) => assert!(ip.is_loopback()),
            other => panic!("unexpected detail {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dns_expected_ip_mismatch() {
        let prober = NetworkProber::new().unwrap();
        let expected: IpAddr = "192.0.2.55".parse().unwrap();
        let result = prober
            .probe_dns(&DnsTarget::new("localhost", Some(expected)), Duration::from_secs(2))
            .await;
        assert!(
            matches!(result, Err(ProbeFailure::AddressMismatch { expected: e, .. }) if e == expected),
            "{:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_dns_unknown_host_fails() {
        let prober = NetworkProber::new().unwrap();
        let result = prober
            .probe_dns(&DnsTarget::new("no-such-host.invalid", None), Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ping_with_zero_timeout_fails_quietly() {
        let prober = NetworkProber::new().unwrap();
        let result = prober.probe_ping("192.0.2.1".parse().unwrap(), Duration::ZERO).await;
        assert!(
            matches!(result, Err(ProbeFailure::Timeout(_)) | Err(ProbeFailure::Socket(_))),
            "{:?}",
            result
        );
    }
}
