//! Server selection
//!
//! One round probes the usable candidates concurrently and stops as soon as
//! any of them answers, trading completeness for startup latency. The
//! responders are moved to the head of the store and the first one's live
//! connection is handed to the caller.

mod probe;

pub use probe::{NetworkProber, ProbeConnection, ProbeResult, Prober};

use crate::config::SelectorConfig;
use crate::server::{ServerEntry, ServerEntryStore};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum concurrent probes
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Interval at which round progress is checked
pub const RESULTS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval at which worker shutdown is checked
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time granted to in-flight probes to unwind after the round ends
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(1000);

/// Overall time allowed for one round
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(20);

/// Connection to the first responder
#[derive(Debug)]
pub struct Winner {
    pub entry: ServerEntry,
    pub connection: ProbeConnection,
    pub response_time: Duration,
}

/// Outcome of one selection round
#[derive(Debug, Default)]
pub struct SelectionResult {
    /// Responding entries, best first
    pub responders: Vec<ServerEntry>,
    pub winner: Option<Winner>,
}

impl SelectionResult {
    pub fn winner_entry(&self) -> Option<&ServerEntry> {
        self.winner.as_ref().map(|w| &w.entry)
    }

    pub fn relay_protocol(&self) -> Option<&'static str> {
        self.winner.as_ref().map(|w| w.connection.relay_protocol)
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }
}

/// Concurrent, time-bounded prober over the server store
pub struct ServerSelector {
    store: Arc<ServerEntryStore>,
    prober: Arc<dyn Prober>,
    config: SelectorConfig,
    egress_region: String,
}

impl ServerSelector {
    pub fn new(
        store: Arc<ServerEntryStore>,
        prober: Arc<dyn Prober>,
        config: SelectorConfig,
        egress_region: impl Into<String>,
    ) -> Self {
        ServerSelector {
            store,
            prober,
            config,
            egress_region: egress_region.into(),
        }
    }

    pub fn prober(&self) -> &Arc<dyn Prober> {
        &self.prober
    }

    /// Run a round over the store's current ordering
    pub async fn select(&self, cancel: &CancellationToken) -> SelectionResult {
        let candidates = self.store.entries();
        self.run(candidates, cancel).await
    }

    /// Whether an entry takes part in probing at all
    pub fn is_candidate(&self, entry: &ServerEntry) -> bool {
        entry.reachability_test_port().is_some()
            && entry.is_tunnel_capable()
            && entry.in_region(&self.egress_region)
    }

    /// Probe `candidates` and return the responders.
    ///
    /// The head of `candidates` is the preferred server and wins whenever
    /// it responds. Returns after the first poll that sees a responder, when
    /// every probe has finished, when the budget is spent, or on `cancel`.
    pub async fn run(
        &self,
        candidates: Vec<ServerEntry>,
        cancel: &CancellationToken,
    ) -> SelectionResult {
        let preferred = candidates.first().map(|e| e.ip_address.clone());
        let mut candidates: Vec<ServerEntry> = candidates
            .into_iter()
            .filter(|e| self.is_candidate(e))
            .collect();
        if candidates.is_empty() {
            debug!("No probeable server candidates");
            return SelectionResult::default();
        }
        if candidates.len() > 1 {
            candidates[1..].shuffle(&mut rand::thread_rng());
        }

        let total = candidates.len();
        let budget = self.config.budget();
        let connect_timeout = self.config.connect_timeout();
        let poll_interval = self.config.poll_interval();
        debug!(
            "Probing {} candidates (concurrency {}, budget {:?})",
            total, self.config.concurrency, budget
        );

        let round = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for entry in candidates {
            let prober = self.prober.clone();
            let semaphore = semaphore.clone();
            let round = round.clone();
            let results_tx = results_tx.clone();
            workers.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = round.cancelled() => return,
                };
                let started = Instant::now();
                let outcome = tokio::select! {
                    outcome = timeout(connect_timeout, prober.probe(&entry, connect_timeout)) => outcome,
                    _ = round.cancelled() => return,
                };
                let result = match outcome {
                    Ok(Ok(conn)) => ProbeResult::responded(entry, started.elapsed(), conn),
                    Ok(Err(e)) => ProbeResult::failed(entry, started.elapsed(), &e),
                    Err(_) => ProbeResult::timed_out(entry, started.elapsed()),
                };
                let _ = results_tx.send(result);
            });
        }
        drop(results_tx);

        let deadline = Instant::now() + budget;
        let mut results: Vec<ProbeResult> = Vec::with_capacity(total);
        let mut proxy_error_logged = false;
        loop {
            while let Ok(result) = results_rx.try_recv() {
                self.record(result, &mut results, &mut proxy_error_logged);
            }

            if results.iter().any(|r| r.responded) {
                break;
            }
            if results.len() >= total {
                debug!("All {} probes finished without a responder", total);
                break;
            }
            if Instant::now() >= deadline {
                info!("Server selection budget of {:?} spent", budget);
                break;
            }

            tokio::select! {
                _ = sleep(poll_interval) => {}
                _ = cancel.cancelled() => {
                    debug!("Server selection cancelled");
                    break;
                }
            }
        }

        round.cancel();
        shutdown_workers(&mut workers).await;
        // Probes that completed while the round was shutting down
        while let Ok(result) = results_rx.try_recv() {
            self.record(result, &mut results, &mut proxy_error_logged);
        }

        if cancel.is_cancelled() {
            return SelectionResult::default();
        }
        self.finish(results, preferred.as_deref())
    }

    fn record(
        &self,
        result: ProbeResult,
        results: &mut Vec<ProbeResult>,
        proxy_error_logged: &mut bool,
    ) {
        if result.responded {
            debug!(
                "Server {} responded in {}ms",
                result.entry.ip_address,
                result.response_time_ms()
            );
        } else if result.upstream_proxy_failure {
            if !*proxy_error_logged {
                *proxy_error_logged = true;
                warn!(
                    "Upstream proxy error: {}",
                    result.failure.as_deref().unwrap_or("unknown")
                );
            }
        } else {
            debug!(
                "Server {} did not respond: {}",
                result.entry.ip_address,
                result.failure.as_deref().unwrap_or("unknown")
            );
        }
        results.push(result);
    }

    fn finish(&self, results: Vec<ProbeResult>, preferred: Option<&str>) -> SelectionResult {
        let mut responders: Vec<(ServerEntry, ProbeConnection, Duration)> = results
            .into_iter()
            .filter_map(|r| {
                let conn = r.live_connection?;
                r.responded.then_some((r.entry, conn, r.response_time))
            })
            .collect();
        if responders.is_empty() {
            return SelectionResult::default();
        }

        responders.shuffle(&mut rand::thread_rng());
        if let Some(preferred) = preferred {
            if let Some(index) = responders
                .iter()
                .position(|(e, _, _)| e.ip_address == preferred)
            {
                let preferred = responders.remove(index);
                responders.insert(0, preferred);
            }
        }

        let mut ordered = Vec::with_capacity(responders.len());
        let mut winner = None;
        // Every connection but the winner's is dropped here, closing it
        for (entry, connection, response_time) in responders {
            if winner.is_none() {
                winner = Some(Winner {
                    entry: entry.clone(),
                    connection,
                    response_time,
                });
            }
            ordered.push(entry);
        }

        self.store.move_entries_to_front(&ordered);
        if let Some(w) = &winner {
            info!(
                "Selected server {} from {} responders ({}ms)",
                w.entry.ip_address,
                ordered.len(),
                w.response_time.as_millis()
            );
        }

        SelectionResult {
            responders: ordered,
            winner,
        }
    }
}

/// Wait up to the grace period for cancelled workers, then abort the rest
async fn shutdown_workers(workers: &mut JoinSet<()>) {
    let grace_deadline = Instant::now() + SHUTDOWN_GRACE;
    while !workers.is_empty() {
        while workers.try_join_next().is_some() {}
        if workers.is_empty() {
            break;
        }
        if Instant::now() >= grace_deadline {
            warn!("Aborting {} unresponsive probe workers", workers.len());
            workers.abort_all();
            break;
        }
        sleep(SHUTDOWN_POLL_INTERVAL).await;
    }
}
