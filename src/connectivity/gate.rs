use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::settings::ConnectivityConfig;
use crate::models::probe::{ProbeMethod, ProbeTarget};

use super::prober::Prober;

/// Last committed connectivity verdict.
#[derive(Debug, Clone, Copy)]
pub struct ConnectivityState {
    pub is_connected: bool,
    /// Start of the probe round that produced this verdict; `None` until the
    /// first round completes.
    pub last_checked: Option<Instant>,
    /// Method whose probe succeeded, if any.
    pub via: Option<ProbeMethod>,
    generation: u64,
}

impl ConnectivityState {
    const INITIAL: ConnectivityState = ConnectivityState {
        is_connected: false,
        last_checked: None,
        via: None,
        generation: 0,
    };
}

/// Cached, single-flight answer to "is the Internet reachable right now?".
///
/// A verdict is reused for `check_interval`. When it goes stale the first
/// caller runs the probe chain while everyone else waits on the same round
/// and receives its result.
pub struct ConnectivityGate {
    prober: Arc<dyn Prober>,
    plan: Vec<(ProbeMethod, Vec<ProbeTarget>)>,
    timeout: Duration,
    check_interval: Duration,
    state: ArcSwap<ConnectivityState>,
    refresh: Mutex<()>,
}

impl ConnectivityGate {
    pub fn new(prober: Arc<dyn Prober>, config: &ConnectivityConfig) -> Self {
        Self::with_plan(prober, config.targets(), config.timeout(), config.check_interval())
    }

    pub fn with_plan(
        prober: Arc<dyn Prober>,
        mut plan: Vec<(ProbeMethod, Vec<ProbeTarget>)>,
        timeout: Duration,
        check_interval: Duration,
    ) -> Self {
        plan.sort_by_key(|(method, _)| *method);
        Self {
            prober,
            plan,
            timeout,
            check_interval,
            state: ArcSwap::from_pointee(ConnectivityState::INITIAL),
            refresh: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> ConnectivityState {
        **self.state.load()
    }

    fn is_fresh(&self, state: &ConnectivityState, now: Instant) -> bool {
        match state.last_checked {
            Some(checked) => now.saturating_duration_since(checked) < self.check_interval,
            None => false,
        }
    }

    /// Cached verdict if fresh, otherwise the result of a new probe round.
    /// `force` always runs a round unless one finishes while waiting.
    pub async fn is_connected(&self, force: bool) -> bool {
        let seen = self.snapshot();
        if !force && self.is_fresh(&seen, Instant::now()) {
            return seen.is_connected;
        }

        let _round = self.refresh.lock().await;

        let current = self.snapshot();
        if current.generation != seen.generation {
            // Another caller finished a round while we waited for the lock.
            return current.is_connected;
        }

        let started = Instant::now();
        let (connected, via) = self.run_round().await;

        if connected != current.is_connected || current.last_checked.is_none() {
            if connected {
                info!(via = ?via, "Internet connectivity available");
            } else {
                warn!("Internet connectivity lost, NCSI endpoints will answer 503");
            }
        }

        self.state.store(Arc::new(ConnectivityState {
            is_connected: connected,
            last_checked: Some(started),
            via,
            generation: current.generation + 1,
        }));
        connected
    }

    /// Walk methods cheapest first and stop at the first success.
    async fn run_round(&self) -> (bool, Option<ProbeMethod>) {
        for (method, targets) in &self.plan {
            for target in targets {
                match self.prober.probe(target, self.timeout).await {
                    Ok(success) => {
                        debug!(
                            method = %method,
                            target = %target,
                            latency_ms = success.latency.as_millis() as u64,
                            "Connectivity probe succeeded"
                        );
                        return (true, Some(*method));
                    }
                    Err(failure) => {
                        debug!(method = %method, target = %target, error = %failure, "Connectivity probe failed");
                    }
                }
            }
        }
        warn!("All connectivity checks failed");
        (false, None)
    }
}
