use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use http::HeaderValue;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::settings::ContentConfig;
use crate::connectivity::gate::ConnectivityGate;
use crate::models::observation::Classification;
use crate::protection::abuse_detector::AbuseDetector;

use super::access_log::AccessLogger;

const SERVER_NAME: &str = concat!("NCSI-Resolver/", env!("CARGO_PKG_VERSION"));
const UNAVAILABLE_BODY: &str = "Internet connectivity check failed";
const NOT_FOUND_BODY: &str = "Not Found";

const DEFAULT_REDIRECT_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Connection Successful</title>
<style>
body{font-family:Arial,sans-serif;text-align:center;padding:40px;background:#f7f7f7}
.box{background:#fff;border-radius:8px;padding:20px;max-width:500px;margin:0 auto;box-shadow:0 2px 5px rgba(0,0,0,.1)}
h1{color:#0078d7}
</style>
</head>
<body>
<div class="box">
<h1>Connection Successful</h1>
<p>Your device is connected to the Internet.</p>
<p>You can close this window.</p>
</div>
</body>
</html>
"#;

/// NCSI endpoints answered by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ConnectTest,
    Ncsi,
    Redirect,
}

impl Endpoint {
    /// Exact path match; the query string is not part of `path`.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/connecttest.txt" => Some(Endpoint::ConnectTest),
            "/ncsi.txt" => Some(Endpoint::Ncsi),
            "/redirect" => Some(Endpoint::Redirect),
            _ => None,
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            Endpoint::ConnectTest | Endpoint::Ncsi => "text/plain",
            Endpoint::Redirect => "text/html",
        }
    }
}

/// Counts one detector observation as in flight until dropped.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Maps each request to 200 / 503 / 404 and feeds the abuse detector.
pub struct HttpHandler {
    /// `None` answers every NCSI endpoint as connected.
    gate: Option<Arc<ConnectivityGate>>,
    detector: Option<Arc<AbuseDetector>>,
    ncsi_text: Bytes,
    redirect_html: Bytes,
    access_log: Option<Arc<AccessLogger>>,
    requests: AtomicU64,
    observations: Arc<watch::Sender<usize>>,
}

impl HttpHandler {
    pub fn new(
        gate: Option<Arc<ConnectivityGate>>,
        detector: Option<Arc<AbuseDetector>>,
        content: &ContentConfig,
        access_log: Option<Arc<AccessLogger>>,
    ) -> Self {
        if gate.is_none() {
            info!("Connectivity verification disabled, NCSI endpoints always answer 200");
        }
        Self {
            gate,
            detector,
            ncsi_text: Bytes::from(content.ncsi_text.clone()),
            redirect_html: load_redirect_html(content.redirect_html_path.as_deref()),
            access_log,
            requests: AtomicU64::new(0),
            observations: Arc::new(watch::channel(0).0),
        }
    }

    /// Total requests answered since startup.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Wait until no detector observation is running. False on timeout.
    pub async fn drain_observations(&self, timeout: Duration) -> bool {
        let mut rx = self.observations.subscribe();
        let drained = match tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        };
        drained
    }

    pub async fn handle(&self, req: Request<Incoming>, client_ip: IpAddr) -> Response<Full<Bytes>> {
        self.respond(req.method(), req.uri().path(), client_ip).await
    }

    pub async fn respond(&self, method: &Method, path: &str, client_ip: IpAddr) -> Response<Full<Bytes>> {
        self.respond_observed(method, path, client_ip).await.0
    }

    /// Answer one request. The detector observation runs on the blocking
    /// pool; its handle is returned so callers may wait for it, the server
    /// never does.
    pub async fn respond_observed(
        &self,
        method: &Method,
        path: &str,
        client_ip: IpAddr,
    ) -> (Response<Full<Bytes>>, Option<JoinHandle<Classification>>) {
        let start = Instant::now();
        let request_number = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let head_only = *method == Method::HEAD;

        let endpoint = match *method {
            Method::GET | Method::HEAD => Endpoint::from_path(path),
            _ => None,
        };

        let (response, outcome) = match endpoint {
            None => (
                plain_response(StatusCode::NOT_FOUND, "text/plain", NOT_FOUND_BODY.into(), head_only),
                "not_found",
            ),
            Some(endpoint) => {
                if self.connected().await {
                    let body = match endpoint {
                        Endpoint::ConnectTest | Endpoint::Ncsi => self.ncsi_text.clone(),
                        Endpoint::Redirect => self.redirect_html.clone(),
                    };
                    (
                        plain_response(StatusCode::OK, endpoint.content_type(), body, head_only),
                        "ok",
                    )
                } else {
                    (
                        plain_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "text/plain",
                            UNAVAILABLE_BODY.into(),
                            head_only,
                        ),
                        "unavailable",
                    )
                }
            }
        };

        let status = response.status().as_u16();
        let elapsed_us = start.elapsed().as_micros() as u64;

        debug!(
            client_ip = %client_ip,
            method = %method,
            path = %path,
            status,
            request = request_number,
            "Request served"
        );

        if let Some(ref log) = self.access_log {
            log.log(
                request_number,
                client_ip,
                method.as_str(),
                path,
                status,
                outcome,
                elapsed_us,
            );
        }

        let observation = self.observe(client_ip, path, method.as_str(), status);
        (response, observation)
    }

    async fn connected(&self) -> bool {
        match self.gate {
            Some(ref gate) => gate.is_connected(false).await,
            None => true,
        }
    }

    /// Hand the request to the detector without waiting for it.
    fn observe(&self, client_ip: IpAddr, path: &str, method: &str, status: u16) -> Option<JoinHandle<Classification>> {
        let detector = Arc::clone(self.detector.as_ref()?);
        let path = path.to_string();
        let method = method.to_string();
        let in_flight = InFlight::enter(&self.observations);
        Some(tokio::task::spawn_blocking(move || {
            let _in_flight = in_flight;
            detector.record(client_ip, &path, &method, status)
        }))
    }
}

/// Response with explicit `Content-Length`. HEAD keeps the headers of the
/// matching GET but carries no body.
fn plain_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
    head_only: bool,
) -> Response<Full<Bytes>> {
    let length = body.len();
    let body = if head_only { Bytes::new() } else { body };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}

/// Custom redirect page from disk, or the built-in page.
pub fn load_redirect_html(path: Option<&str>) -> Bytes {
    let Some(path) = path else {
        return Bytes::from_static(DEFAULT_REDIRECT_HTML.as_bytes());
    };
    match std::fs::read(path) {
        Ok(content) => {
            info!(path, bytes = content.len(), "Loaded custom redirect page");
            Bytes::from(content)
        }
        Err(e) => {
            warn!(path, error = %e, "Failed to read redirect page, using built-in page");
            Bytes::from_static(DEFAULT_REDIRECT_HTML.as_bytes())
        }
    }
}
