use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::settings::ServerConfig;

use super::http_handler::HttpHandler;
use super::readiness::Readiness;

const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BindFailure {
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("could not bind {addr} after {attempts} attempt(s): {source}. Is another service using the port, or does binding it need elevated privileges?")]
    Exhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// HTTP listener for the NCSI endpoints.
pub struct NcsiServer {
    config: ServerConfig,
    handler: Arc<HttpHandler>,
    readiness: Arc<Readiness>,
}

impl NcsiServer {
    pub fn new(config: ServerConfig, handler: Arc<HttpHandler>, readiness: Arc<Readiness>) -> Self {
        Self {
            config,
            handler,
            readiness,
        }
    }

    /// Bind the configured address, retrying `bind_retries` times.
    pub async fn bind(&self) -> Result<TcpListener, BindFailure> {
        bind_with_retries(&self.config.bind_addr(), self.config.bind_retries, BIND_RETRY_DELAY).await
    }

    /// Accept connections until the task is cancelled.
    pub async fn serve(&self, listener: TcpListener) {
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "Listener has no local address");
                return;
            }
        };

        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let header_timeout = Duration::from_secs(self.config.request_timeout_secs.max(1));

        info!(addr = %local_addr, max_connections = self.config.max_connections, "NCSI listener started");
        self.readiness.mark_ready(local_addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to accept TCP connection: {}", err);
                    continue;
                }
            };

            let peer_ip = peer_addr.ip().to_canonical();

            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                debug!(client_ip = %peer_ip, "Max connections reached, dropping");
                drop(stream);
                continue;
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                handle_connection(stream, handler, peer_ip, header_timeout).await;
                drop(permit);
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<HttpHandler>,
    peer_ip: IpAddr,
    header_timeout: Duration,
) {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let h = Arc::clone(&handler);
        async move { Ok::<_, hyper::Error>(h.handle(req, peer_ip).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .keep_alive(true)
        .serve_connection(io, service);

    if let Err(err) = conn.await {
        debug!(client_ip = %peer_ip, error = %err, "HTTP connection error");
    }
}

pub async fn bind_with_retries(addr: &str, attempts: u32, delay: Duration) -> Result<TcpListener, BindFailure> {
    let sock_addr: SocketAddr = addr.parse().map_err(|e: std::net::AddrParseError| {
        BindFailure::InvalidAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        }
    })?;

    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match bind_tcp_listener(sock_addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < attempts => {
                warn!(addr = %sock_addr, attempt, error = %e, "Bind failed, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(BindFailure::Exhausted {
                    addr: sock_addr.to_string(),
                    attempts,
                    source: e,
                })
            }
        }
    }
}

fn bind_tcp_listener(sock_addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if sock_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}
