use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

/// One served request as written to the access log.
#[derive(Debug, Serialize)]
pub struct AccessRecord<'a> {
    pub ts: String,
    pub n: u64,
    pub ip: IpAddr,
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub outcome: &'a str,
    pub us: u64,
}

/// Per-request access logger that writes one JSON line per request.
/// Writes go straight to the `File` so every line is visible immediately.
pub struct AccessLogger {
    writer: Mutex<File>,
}

impl AccessLogger {
    /// Open (or create) the access log file in append mode.
    pub fn new(path: &str) -> std::io::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(file),
        })
    }

    pub fn log(
        &self,
        request_number: u64,
        client_ip: IpAddr,
        method: &str,
        path: &str,
        status: u16,
        outcome: &str,
        elapsed_us: u64,
    ) {
        let record = AccessRecord {
            ts: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            n: request_number,
            ip: client_ip,
            method,
            path,
            status,
            outcome,
            us: elapsed_us,
        };

        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        let mut f = self.writer.lock();
        let _ = writeln!(f, "{}", line);
    }
}
