use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Ready(SocketAddr),
    Stopped,
}

/// "Port is bound and serving" signal, optionally mirrored to a file.
pub struct Readiness {
    tx: watch::Sender<ServiceState>,
    ready_file: Option<PathBuf>,
}

impl Readiness {
    pub fn new(ready_file: Option<PathBuf>) -> Self {
        let (tx, _) = watch::channel(ServiceState::Starting);
        Self { tx, ready_file }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> ServiceState {
        *self.tx.borrow()
    }

    pub fn mark_ready(&self, addr: SocketAddr) {
        self.tx.send_replace(ServiceState::Ready(addr));
        if let Some(ref path) = self.ready_file {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::write(path, format!("{}\n", addr)) {
                Ok(()) => debug!(path = %path.display(), "Ready file written"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write ready file"),
            }
        }
    }

    pub fn mark_stopped(&self) {
        self.tx.send_replace(ServiceState::Stopped);
        if let Some(ref path) = self.ready_file {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove ready file");
                }
            }
        }
    }
}

/// Wait until the service reports ready; `None` if it stopped first.
pub async fn wait_ready(mut rx: watch::Receiver<ServiceState>) -> Option<SocketAddr> {
    let state = rx
        .wait_for(|s| !matches!(s, ServiceState::Starting))
        .await
        .ok()
        .map(|s| *s)?;
    match state {
        ServiceState::Ready(addr) => Some(addr),
        _ => None,
    }
}

/// Address to dial for a local check of a listener bound to `addr`.
pub fn loopback_for(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

/// Connect to our own listener once it reports ready.
pub async fn self_check(addr: SocketAddr, timeout: Duration) -> bool {
    let target = loopback_for(addr);
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => {
            info!(addr = %target, "Self-check succeeded, service is accepting connections");
            true
        }
        Ok(Err(e)) => {
            warn!(addr = %target, error = %e, "Self-check failed, service may not be reachable");
            false
        }
        Err(_) => {
            warn!(addr = %target, "Self-check timed out");
            false
        }
    }
}
