use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::observation::ConnectionLogEntry;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path} does not contain a valid connection log: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable storage for the retained connection records.
pub trait LogSink: Send + Sync {
    /// Replace the stored records with `entries`.
    fn persist(&self, entries: &[ConnectionLogEntry]) -> Result<(), PersistenceError>;

    /// Records left by a previous run; empty when nothing was stored yet.
    fn load(&self) -> Result<Vec<ConnectionLogEntry>, PersistenceError>;
}

/// Whole-file JSON array, rewritten through a temporary file and a rename.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl LogSink for JsonFileSink {
    fn persist(&self, entries: &[ConnectionLogEntry]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let json = serde_json::to_vec_pretty(entries).map_err(|e| PersistenceError::Format {
            path: self.path.display().to_string(),
            source: e,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<ConnectionLogEntry>, PersistenceError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_slice(&raw).map_err(|e| PersistenceError::Format {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

struct Buffer {
    entries: VecDeque<ConnectionLogEntry>,
    unflushed: usize,
}

/// Bounded in-memory list of observed requests with periodic persistence.
pub struct ConnectionLog {
    buffer: Mutex<Buffer>,
    /// Serializes sink writes so snapshots land in the order they were taken.
    write: Mutex<()>,
    sink: Option<Box<dyn LogSink>>,
    max_entries: usize,
    flush_every: usize,
}

impl ConnectionLog {
    /// Log without durable storage.
    pub fn in_memory(max_entries: usize) -> Self {
        Self::build(None, max_entries, usize::MAX, VecDeque::new())
    }

    /// Log backed by `sink`. Records from a previous run are loaded back;
    /// a sink that cannot be read starts the log empty.
    pub fn with_sink(sink: Box<dyn LogSink>, max_entries: usize, flush_every: usize) -> Self {
        let mut entries: VecDeque<ConnectionLogEntry> = match sink.load() {
            Ok(entries) => entries.into(),
            Err(e) => {
                warn!(error = %e, "Failed to load previous connection log, starting empty");
                VecDeque::new()
            }
        };
        while entries.len() > max_entries {
            entries.pop_front();
        }
        if !entries.is_empty() {
            info!(entries = entries.len(), "Loaded connection log from previous run");
        }
        Self::build(Some(sink), max_entries, flush_every.max(1), entries)
    }

    fn build(
        sink: Option<Box<dyn LogSink>>,
        max_entries: usize,
        flush_every: usize,
        entries: VecDeque<ConnectionLogEntry>,
    ) -> Self {
        Self {
            buffer: Mutex::new(Buffer {
                entries,
                unflushed: 0,
            }),
            write: Mutex::new(()),
            sink,
            max_entries: max_entries.max(1),
            flush_every,
        }
    }

    /// Append one record, discarding the oldest beyond the cap, and persist
    /// every `flush_every` records. Persistence failures are logged only.
    pub fn append(&self, entry: ConnectionLogEntry) {
        let due = {
            let mut buffer = self.buffer.lock();
            buffer.entries.push_back(entry);
            while buffer.entries.len() > self.max_entries {
                buffer.entries.pop_front();
            }
            buffer.unflushed += 1;
            self.sink.is_some() && buffer.unflushed >= self.flush_every
        };

        if due {
            if let Err(e) = self.flush() {
                warn!(error = %e, "Failed to persist connection log");
            }
        }
    }

    /// Write the retained records to the sink now.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        let Some(ref sink) = self.sink else {
            return Ok(());
        };

        let _write = self.write.lock();
        let snapshot: Vec<ConnectionLogEntry> = {
            let mut buffer = self.buffer.lock();
            buffer.unflushed = 0;
            buffer.entries.iter().cloned().collect()
        };
        sink.persist(&snapshot)?;
        debug!(entries = snapshot.len(), "Connection log persisted");
        Ok(())
    }

    /// The newest `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ConnectionLogEntry> {
        let buffer = self.buffer.lock();
        let skip = buffer.entries.len().saturating_sub(limit);
        buffer.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
