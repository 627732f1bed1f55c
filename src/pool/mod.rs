//! Bounded multi-server connection race with first-server affinity.
//!
//! The pool keeps up to `pool_limit` candidates connecting at once. The
//! first listed server gets a head start: a faster candidate for another
//! server is held as a tentative winner until the head start elapses, the
//! first server connects, or the first server fails.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::{CancellationReason, CancellationScope};
use crate::catalog::{ServerCatalog, ServerEntry};
use crate::error::{ErrorContext, Result};
use crate::process::ProcessLauncher;
use crate::task::{ExitBarrier, TaskConfig};
use crate::transport::{
    build_launch_command, CandidateTask, ConnectionAttemptResult, ConnectionCandidate, EraConfig,
    EraLimits, HelperConfig, TransportKind,
};

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum candidates connecting at once.
    #[serde(default = "default_pool_limit")]
    pub pool_limit: usize,

    /// Leading catalog entries kept in order; the rest are shuffled.
    #[serde(default = "default_head_size")]
    pub head_size: usize,

    /// How long the first listed server may still beat a faster one.
    #[serde(default = "default_head_start", with = "humantime_serde")]
    pub head_start: Duration,

    /// Interval between polls of in-flight candidates.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Per-candidate connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_pool_limit() -> usize {
    10
}
fn default_head_size() -> usize {
    2
}
fn default_head_start() -> Duration {
    Duration::from_millis(500)
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_limit: default_pool_limit(),
            head_size: default_head_size(),
            head_start: default_head_start(),
            poll_interval: default_poll_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Out-of-band request for a fresh server list.
pub trait RemoteListRefresher: Send + Sync {
    /// Must not block.
    fn request_refresh(&self, kind: TransportKind);
}

/// How a race ended.
#[derive(Debug)]
pub enum RaceOutcome {
    /// A candidate connected and was chosen.
    Won(Arc<CandidateTask>),
    /// A cancellation reason was raised.
    Cancelled(CancellationReason),
    /// Every server was tried without a connection.
    Exhausted,
}

impl RaceOutcome {
    pub fn is_won(&self) -> bool {
        matches!(self, Self::Won(_))
    }
}

/// Counters for one race.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Candidates launched or attempted.
    pub attempted: usize,
    /// Candidates that connected, including displaced tentative winners.
    pub connected: usize,
    /// Candidates whose helper died or refused to launch.
    pub failed: usize,
    /// Candidates that hit the connect timeout.
    pub timed_out: usize,
    /// Servers skipped because no launch command could be built.
    pub misconfigured: usize,
    /// Highest number of candidates in flight at once.
    pub peak_in_flight: usize,
    /// Whether the first listed server failed during the race.
    pub affinity_aborted: bool,
    pub elapsed: Duration,
}

/// Outcome plus counters.
#[derive(Debug)]
pub struct RaceReport {
    pub outcome: RaceOutcome,
    pub stats: PoolStats,
}

/// Keep the first `head_size` entries in place and shuffle the rest.
pub fn order_servers<R: Rng + ?Sized>(
    mut servers: Vec<ServerEntry>,
    head_size: usize,
    rng: &mut R,
) -> Vec<ServerEntry> {
    let head = head_size.min(servers.len());
    servers[head..].shuffle(rng);
    servers
}

struct InFlight {
    task: CandidateTask,
    first: bool,
}

struct Winner {
    task: CandidateTask,
    first: bool,
}

/// Counts candidates still being torn down in the background. They keep
/// their slot until their helper is gone.
#[derive(Clone, Default)]
struct Reaper(Arc<AtomicUsize>);

impl Reaper {
    fn pending(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn reap(&self, task: CandidateTask) {
        self.0.fetch_add(1, Ordering::SeqCst);
        let slot = ReapSlot(Arc::clone(&self.0));
        tokio::spawn(async move {
            task.stop().await;
            drop(slot);
        });
    }
}

struct ReapSlot(Arc<AtomicUsize>);

impl Drop for ReapSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Races candidates for one transport against one catalog.
pub struct ConnectionPool {
    kind: TransportKind,
    catalog: Arc<ServerCatalog>,
    launcher: Arc<dyn ProcessLauncher>,
    helper: HelperConfig,
    era: EraConfig,
    config: PoolConfig,
    task: TaskConfig,
    refresher: Option<Arc<dyn RemoteListRefresher>>,
}

impl ConnectionPool {
    pub fn new(
        kind: TransportKind,
        catalog: Arc<ServerCatalog>,
        launcher: Arc<dyn ProcessLauncher>,
        helper: HelperConfig,
        config: PoolConfig,
    ) -> Self {
        Self {
            kind,
            catalog,
            launcher,
            helper,
            era: EraConfig::default(),
            config,
            task: TaskConfig::default(),
            refresher: None,
        }
    }

    pub fn with_era_config(mut self, era: EraConfig) -> Self {
        self.era = era;
        self
    }

    pub fn with_task_config(mut self, task: TaskConfig) -> Self {
        self.task = task;
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn RemoteListRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn catalog(&self) -> &Arc<ServerCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Race candidates for `servers` until one wins, `scope` is raised or
    /// every server has been tried.
    ///
    /// The winner's server is marked succeeded before this returns. With a
    /// barrier, every candidate joins it.
    pub async fn race(
        &self,
        servers: Vec<ServerEntry>,
        scope: &CancellationScope,
        barrier: Option<&ExitBarrier>,
    ) -> RaceReport {
        let started = Instant::now();
        let mut stats = PoolStats::default();

        let servers = order_servers(servers, self.config.head_size, &mut rand::thread_rng());
        let mut pending: VecDeque<(ServerEntry, bool)> = servers
            .into_iter()
            .enumerate()
            .map(|(i, entry)| (entry, i == 0))
            .collect();

        let limit = self.config.pool_limit.max(1);
        let mut in_flight: Vec<InFlight> = Vec::with_capacity(limit);
        let mut winner: Option<Winner> = None;
        let reaper = Reaper::default();

        debug!(transport = %self.kind, servers = pending.len(), "race started");

        let outcome = loop {
            let raised = scope.check(CancellationReason::ALL);
            if !raised.is_empty() {
                break self.cancelled(raised, in_flight, winner, &reaper);
            }

            let mut i = 0;
            while i < in_flight.len() {
                match in_flight[i].task.body().attempt_result(self.config.connect_timeout) {
                    ConnectionAttemptResult::Pending => i += 1,
                    ConnectionAttemptResult::Failed => {
                        let lost = in_flight.remove(i);
                        stats.failed += 1;
                        self.discard(lost, false, &mut stats, &reaper);
                    }
                    ConnectionAttemptResult::TimedOut => {
                        let lost = in_flight.remove(i);
                        stats.timed_out += 1;
                        self.discard(lost, true, &mut stats, &reaper);
                    }
                    ConnectionAttemptResult::Connected => {
                        let won = in_flight.remove(i);
                        stats.connected += 1;
                        // A held first-server winner is never displaced.
                        if winner.as_ref().is_some_and(|held| held.first) {
                            debug!(server = %won.task.body().entry(), "late connect after first server won");
                            reaper.reap(won.task);
                            continue;
                        }
                        // Only the kept winner moves to the catalog front.
                        self.record(
                            self.catalog.mark_succeeded(won.task.body().entry()),
                            "mark_succeeded",
                            won.task.body().entry(),
                        );
                        if let Some(previous) = winner.replace(Winner {
                            task: won.task,
                            first: won.first,
                        }) {
                            debug!(server = %previous.task.body().entry(), "tentative winner displaced");
                            reaper.reap(previous.task);
                        }
                    }
                }
            }

            let decided = winner.as_ref().is_some_and(|held| {
                held.first || stats.affinity_aborted || started.elapsed() >= self.config.head_start
            });
            if decided {
                break self.won(winner, in_flight, &reaper);
            }

            while in_flight.len() + reaper.pending() < limit {
                let Some((entry, first)) = pending.pop_front() else {
                    break;
                };
                stats.attempted += 1;
                if let Some(task) = self.launch(entry, first, scope, barrier, &mut stats).await {
                    in_flight.push(InFlight { task, first });
                }
            }
            stats.peak_in_flight = stats.peak_in_flight.max(in_flight.len() + reaper.pending());

            if in_flight.is_empty() && pending.is_empty() {
                break self.won(winner, in_flight, &reaper);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = scope.raised(CancellationReason::ALL) => {}
            }
        };

        stats.elapsed = started.elapsed();
        match outcome {
            RaceOutcome::Won(ref task) => info!(
                transport = %self.kind,
                server = %task.body().entry(),
                attempted = stats.attempted,
                elapsed = ?stats.elapsed,
                "race won"
            ),
            RaceOutcome::Cancelled(reason) => debug!(transport = %self.kind, %reason, "race cancelled"),
            RaceOutcome::Exhausted => warn!(
                transport = %self.kind,
                attempted = stats.attempted,
                failed = stats.failed,
                timed_out = stats.timed_out,
                "race exhausted"
            ),
        }
        RaceReport { outcome, stats }
    }

    async fn launch(
        &self,
        entry: ServerEntry,
        first: bool,
        scope: &CancellationScope,
        barrier: Option<&ExitBarrier>,
        stats: &mut PoolStats,
    ) -> Option<CandidateTask> {
        let command = match build_launch_command(self.kind, &entry, &self.helper) {
            Ok(command) => command,
            Err(e) => {
                warn!(server = %entry, error = %e, "cannot build launch command");
                stats.misconfigured += 1;
                self.lose(&entry, first, stats);
                return None;
            }
        };

        let limits = EraLimits::for_server(&entry, &self.era);
        let candidate = ConnectionCandidate::new(
            self.kind,
            entry.clone(),
            command,
            Arc::clone(&self.launcher),
            limits,
            self.task.graceful_stop_timeout,
        );
        let task = CandidateTask::new(Arc::new(candidate), self.task.clone());

        if task.start(scope, barrier.cloned()).await {
            Some(task)
        } else {
            stats.failed += 1;
            self.lose(&entry, first, stats);
            None
        }
    }

    fn discard(&self, lost: InFlight, timed_out: bool, stats: &mut PoolStats, reaper: &Reaper) {
        let entry = lost.task.body().entry().clone();
        debug!(server = %entry, timed_out, "candidate dropped");
        reaper.reap(lost.task);
        self.lose(&entry, lost.first, stats);

        if timed_out {
            if let Some(ref refresher) = self.refresher {
                refresher.request_refresh(self.kind);
            }
        }
    }

    fn lose(&self, entry: &ServerEntry, first: bool, stats: &mut PoolStats) {
        self.record(self.catalog.mark_failed(entry), "mark_failed", entry);
        if first && !stats.affinity_aborted {
            debug!(server = %entry, "first server failed, affinity aborted");
            stats.affinity_aborted = true;
        }
    }

    fn record(&self, result: Result<()>, operation: &str, entry: &ServerEntry) {
        if let Err(e) = result {
            let context = ErrorContext::new(operation)
                .with_server(entry.address.clone())
                .with_transport(self.kind.to_string());
            warn!(%context, error = %e, "catalog update failed");
        }
    }

    fn won(&self, winner: Option<Winner>, in_flight: Vec<InFlight>, reaper: &Reaper) -> RaceOutcome {
        for loser in in_flight {
            reaper.reap(loser.task);
        }
        match winner {
            Some(winner) => RaceOutcome::Won(Arc::new(winner.task)),
            None => RaceOutcome::Exhausted,
        }
    }

    fn cancelled(
        &self,
        reason: CancellationReason,
        in_flight: Vec<InFlight>,
        winner: Option<Winner>,
        reaper: &Reaper,
    ) -> RaceOutcome {
        for candidate in in_flight {
            reaper.reap(candidate.task);
        }
        if let Some(winner) = winner {
            reaper.reap(winner.task);
        }
        RaceOutcome::Cancelled(reason)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("kind", &self.kind)
            .field("catalog", &self.catalog.key())
            .field("config", &self.config)
            .finish()
    }
}
