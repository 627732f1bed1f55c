//! Reachability-based catalog reordering.
//!
//! Probes a sample of servers with a plain TCP connect on their advertised
//! reachability port and moves the fast responders to the front of the
//! catalog. This approximates "currently reachable" without a full protocol
//! handshake against every candidate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{ServerCatalog, ServerEntry};
use crate::cancel::{CancellationReason, CancellationScope, CancellationSignal};
use crate::error::{Error, Result};
use crate::task::TaskBody;

/// Reachability reorder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    /// Run a reorder pass on each connect.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum servers probed per round.
    #[serde(default = "default_max_probe_servers")]
    pub max_probe_servers: usize,

    /// Maximum concurrent probes.
    #[serde(default = "default_max_workers")]
    pub max_worker_threads: usize,

    /// Wall-clock cap on a whole round.
    #[serde(default = "default_max_check_time", with = "humantime_serde")]
    pub max_check_time: Duration,

    /// Responders within `fastest * threshold_factor` are promoted.
    #[serde(default = "default_threshold_factor")]
    pub threshold_factor: f64,

    /// How long teardown waits for a cancelled round to unwind.
    #[serde(default = "default_join_timeout", with = "humantime_serde")]
    pub join_timeout: Duration,
}

fn default_enabled() -> bool {
    true
}
fn default_max_probe_servers() -> usize {
    30
}
fn default_max_workers() -> usize {
    30
}
fn default_max_check_time() -> Duration {
    Duration::from_secs(5)
}
fn default_threshold_factor() -> f64 {
    2.0
}
fn default_join_timeout() -> Duration {
    Duration::from_millis(500)
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_probe_servers: default_max_probe_servers(),
            max_worker_threads: default_max_workers(),
            max_check_time: default_max_check_time(),
            threshold_factor: default_threshold_factor(),
            join_timeout: default_join_timeout(),
        }
    }
}

/// Outcome of probing one server.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub address: String,
    pub responded: bool,
    pub elapsed: Duration,
}

/// Summary of one completed round.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// Servers probed.
    pub probed: usize,
    /// Servers that accepted a connection.
    pub responded: usize,
    /// Addresses moved to the front, in their new order.
    pub promoted: Vec<String>,
}

/// Pick the servers to probe: entries without a reachability port are
/// skipped, the first half of the budget comes from the head of the list
/// in order, the rest is a random sample of the remainder.
pub fn select_probe_targets<R: Rng + ?Sized>(
    entries: &[ServerEntry],
    max: usize,
    rng: &mut R,
) -> Vec<ServerEntry> {
    let probeable: Vec<&ServerEntry> = entries
        .iter()
        .filter(|e| e.reachability_port.is_some())
        .collect();

    let head = (max / 2).min(probeable.len());
    let mut targets: Vec<ServerEntry> = probeable[..head].iter().map(|e| (*e).clone()).collect();

    let mut rest: Vec<&ServerEntry> = probeable[head..].to_vec();
    rest.shuffle(rng);
    targets.extend(rest.into_iter().take(max - head).cloned());
    targets
}

/// Responders whose elapsed time is within `fastest * factor`, in result order.
pub fn select_promoted(results: &[ProbeResult], factor: f64) -> Vec<String> {
    let Some(fastest) = results.iter().filter(|r| r.responded).map(|r| r.elapsed).min() else {
        return Vec::new();
    };
    // Saturate rather than overflow for very large factors.
    let threshold = Duration::try_from_secs_f64(fastest.as_secs_f64() * factor.max(1.0))
        .unwrap_or(Duration::MAX);

    results
        .iter()
        .filter(|r| r.responded && r.elapsed <= threshold)
        .map(|r| r.address.clone())
        .collect()
}

/// Probe `targets` concurrently.
///
/// The round is capped at `max_check_time`; probes still running at the cap
/// are abandoned and only the results gathered so far are returned.
pub async fn probe_round(
    targets: &[ServerEntry],
    config: &ReachabilityConfig,
    scope: &CancellationScope,
) -> Result<Vec<ProbeResult>> {
    scope.check_or_err(CancellationReason::ALL)?;

    let semaphore = Arc::new(Semaphore::new(config.max_worker_threads.max(1)));
    let results = Arc::new(Mutex::new(Vec::with_capacity(targets.len())));
    let mut probes = JoinSet::new();

    for target in targets {
        let Some(port) = target.reachability_port else {
            continue;
        };
        let address = target.address.clone();
        let semaphore = Arc::clone(&semaphore);
        let results = Arc::clone(&results);
        let timeout = config.max_check_time;

        probes.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let started = Instant::now();
            let responded = matches!(
                tokio::time::timeout(timeout, TcpStream::connect((address.as_str(), port))).await,
                Ok(Ok(_))
            );
            results.lock().push(ProbeResult {
                address,
                responded,
                elapsed: started.elapsed(),
            });
        });
    }

    let drain = async {
        while probes.join_next().await.is_some() {}
    };

    tokio::select! {
        _ = drain => {}
        _ = tokio::time::sleep(config.max_check_time) => {
            debug!("reachability round hit its time cap");
        }
        raised = scope.raised(CancellationReason::ALL) => {
            probes.abort_all();
            return Err(Error::Cancelled(raised.first().unwrap_or(CancellationReason::CANCEL)));
        }
    }
    // Stragglers are dropped; their results are not waited for.
    probes.abort_all();

    let results = results.lock().clone();
    Ok(results)
}

/// Background pass that probes the catalog and promotes fast responders.
pub struct ReachabilityReorder {
    catalog: Arc<ServerCatalog>,
    config: ReachabilityConfig,
    scope: CancellationScope,
    abort: CancellationSignal,
    round: Mutex<Option<JoinHandle<Result<RoundReport>>>>,
    report: Mutex<Option<RoundReport>>,
}

impl ReachabilityReorder {
    /// Create a pass over `catalog`, observing `scope`.
    pub fn new(
        catalog: Arc<ServerCatalog>,
        config: ReachabilityConfig,
        scope: CancellationScope,
    ) -> Self {
        Self {
            catalog,
            config,
            scope,
            abort: CancellationSignal::new(),
            round: Mutex::new(None),
            report: Mutex::new(None),
        }
    }

    /// Report of the last completed round.
    pub fn report(&self) -> Option<RoundReport> {
        self.report.lock().clone()
    }

    /// Run one round to completion on the current task.
    pub async fn run_round(&self) -> Result<RoundReport> {
        run_round(
            Arc::clone(&self.catalog),
            self.config.clone(),
            self.scope.clone().with(self.abort.clone()),
        )
        .await
    }
}

async fn run_round(
    catalog: Arc<ServerCatalog>,
    config: ReachabilityConfig,
    scope: CancellationScope,
) -> Result<RoundReport> {
    let entries = catalog.entries()?;
    let targets = select_probe_targets(&entries, config.max_probe_servers, &mut rand::thread_rng());
    if targets.is_empty() {
        debug!(catalog = %catalog.key(), "no probeable servers");
        return Ok(RoundReport::default());
    }

    let results = probe_round(&targets, &config, &scope).await?;
    let mut promoted = select_promoted(&results, config.threshold_factor);
    promoted.shuffle(&mut rand::thread_rng());

    // A cancelled round must not reorder the catalog.
    scope.check_or_err(CancellationReason::ALL)?;
    catalog.promote(&promoted)?;

    let report = RoundReport {
        probed: targets.len(),
        responded: results.iter().filter(|r| r.responded).count(),
        promoted,
    };
    info!(
        catalog = %catalog.key(),
        probed = report.probed,
        responded = report.responded,
        promoted = report.promoted.len(),
        "reachability reorder complete"
    );
    Ok(report)
}

#[async_trait]
impl TaskBody for ReachabilityReorder {
    fn name(&self) -> String {
        format!("reachability-reorder[{}]", self.catalog.key())
    }

    async fn on_start(&self) -> Result<bool> {
        let handle = tokio::spawn(run_round(
            Arc::clone(&self.catalog),
            self.config.clone(),
            self.scope.clone().with(self.abort.clone()),
        ));
        *self.round.lock() = Some(handle);
        Ok(true)
    }

    async fn on_periodic_check(&self) -> Result<bool> {
        let finished = self
            .round
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished);
        if !finished {
            return Ok(true);
        }

        let handle = self.round.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(report)) => *self.report.lock() = Some(report),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(catalog = %self.catalog.key(), error = %e, "reachability reorder failed"),
                Err(e) => warn!(catalog = %self.catalog.key(), error = %e, "reachability round aborted"),
            }
        }
        Ok(false)
    }

    async fn on_stop_imminent(&self) {
        self.abort.raise(CancellationReason::CANCEL);
    }

    async fn on_stop(&self, _cleanly: bool) {
        let handle = self.round.lock().take();
        if let Some(mut handle) = handle {
            // Best-effort join; a stuck round is abandoned.
            if tokio::time::timeout(self.config.join_timeout, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }
}
