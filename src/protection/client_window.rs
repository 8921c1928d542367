use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Distinct paths remembered per client; beyond this the count saturates.
const MAX_TRACKED_PATHS: usize = 1024;

/// Recent request times and distinct paths seen from one client.
#[derive(Debug, Clone, Default)]
pub struct ClientWindow {
    timestamps: VecDeque<Instant>,
    /// Path -> last time it was requested.
    paths: HashMap<String, Instant>,
}

impl ClientWindow {
    /// Drop timestamps that are `window` old or older. With `windowed_paths`
    /// the path set expires the same way; otherwise it lives as long as the
    /// entry does.
    pub fn prune(&mut self, now: Instant, window: Duration, windowed_paths: bool) {
        let expired = |ts: &Instant| now.saturating_duration_since(*ts) >= window;

        while let Some(front) = self.timestamps.front() {
            if expired(front) {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if windowed_paths {
            self.paths.retain(|_, seen| !expired(seen));
        }
    }

    pub fn record(&mut self, now: Instant, path: &str) {
        self.timestamps.push_back(now);
        if let Some(seen) = self.paths.get_mut(path) {
            *seen = now;
        } else if self.paths.len() < MAX_TRACKED_PATHS {
            self.paths.insert(path.to_string(), now);
        }
    }

    pub fn request_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Requests younger than `window` at `now`, without mutating.
    pub fn count_in_window(&self, now: Instant, window: Duration) -> usize {
        self.timestamps
            .iter()
            .filter(|ts| now.saturating_duration_since(**ts) < window)
            .count()
    }

    pub fn unique_paths(&self) -> usize {
        self.paths.len()
    }

    /// No request inside the window; the entry can be evicted.
    pub fn is_idle(&self) -> bool {
        self.timestamps.is_empty()
    }
}
