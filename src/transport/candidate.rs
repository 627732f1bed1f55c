//! One connection attempt to one server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Era, EraLimits, TransportKind};
use crate::catalog::ServerEntry;
use crate::error::Result;
use crate::process::{LaunchCommand, ProcessHandle, ProcessLauncher, ReadLine};
use crate::task::{SupervisedTask, TaskBody};

/// A candidate driven by a [`SupervisedTask`].
pub type CandidateTask = SupervisedTask<ConnectionCandidate>;

/// Outcome of polling a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAttemptResult {
    /// Still connecting.
    Pending,
    /// The success marker was seen.
    Connected,
    /// The helper died, failed to launch or its output closed.
    Failed,
    /// Not connected within the connect timeout.
    TimedOut,
}

/// A helper process connecting to one server, with its era lifecycle.
pub struct ConnectionCandidate {
    kind: TransportKind,
    entry: ServerEntry,
    command: LaunchCommand,
    launcher: Arc<dyn ProcessLauncher>,
    limits: EraLimits,
    graceful_stop_timeout: Duration,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
    started_at: Mutex<Option<Instant>>,
    connected_at: Mutex<Option<Instant>>,
    connected: AtomicBool,
}

impl ConnectionCandidate {
    pub fn new(
        kind: TransportKind,
        entry: ServerEntry,
        command: LaunchCommand,
        launcher: Arc<dyn ProcessLauncher>,
        limits: EraLimits,
        graceful_stop_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            entry,
            command,
            launcher,
            limits,
            graceful_stop_timeout,
            process: Mutex::new(None),
            started_at: Mutex::new(None),
            connected_at: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn entry(&self) -> &ServerEntry {
        &self.entry
    }

    pub fn limits(&self) -> EraLimits {
        self.limits
    }

    /// Launch the helper. Returns `Ok(true)` if a helper is running.
    pub fn connect(&self) -> Result<bool> {
        let mut process = self.process.lock();
        if process.is_some() {
            return Ok(true);
        }

        let handle = self.launcher.launch(&self.command)?;
        *process = Some(handle);
        *self.started_at.lock() = Some(Instant::now());
        *self.connected_at.lock() = None;
        self.connected.store(false, Ordering::SeqCst);

        debug!(server = %self.entry, transport = %self.kind, "candidate launched");
        Ok(true)
    }

    /// Drain available helper output without blocking.
    ///
    /// Returns `(ok, connected)`. `connected` latches once the success
    /// marker was seen. `ok` is false when the helper is gone, never
    /// launched or its output closed.
    pub fn poll_connected(&self) -> (bool, bool) {
        let mut guard = self.process.lock();
        let Some(process) = guard.as_mut() else {
            return (false, self.is_connected());
        };

        let mut ok = true;
        loop {
            match process.read_line() {
                ReadLine::Line(line) => {
                    if !self.is_connected() && self.command.is_success_line(&line) {
                        *self.connected_at.lock() = Some(Instant::now());
                        self.connected.store(true, Ordering::SeqCst);
                        info!(server = %self.entry, transport = %self.kind, "candidate connected");
                    }
                }
                ReadLine::Pending => break,
                ReadLine::Closed => {
                    ok = false;
                    break;
                }
            }
        }
        if ok && !process.is_alive() {
            ok = false;
        }
        if !ok {
            debug!(server = %self.entry, "candidate helper exited");
        }
        (ok, self.is_connected())
    }

    /// Poll and classify against `connect_timeout`.
    pub fn attempt_result(&self, connect_timeout: Duration) -> ConnectionAttemptResult {
        let (ok, connected) = self.poll_connected();
        if !ok {
            ConnectionAttemptResult::Failed
        } else if connected {
            ConnectionAttemptResult::Connected
        } else if self.elapsed().is_some_and(|e| e >= connect_timeout) {
            ConnectionAttemptResult::TimedOut
        } else {
            ConnectionAttemptResult::Pending
        }
    }

    /// Whether the success marker has been seen.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Time since launch.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.lock().map(|t| t.elapsed())
    }

    pub fn connected_at(&self) -> Option<Instant> {
        *self.connected_at.lock()
    }

    /// Time since the success marker was seen.
    pub fn connected_for(&self) -> Option<Duration> {
        self.connected_at().map(|t| t.elapsed())
    }

    /// Current era. Candidates that have not connected are fresh.
    pub fn era(&self) -> Era {
        self.connected_for()
            .map_or(Era::Fresh, |age| self.limits.era_at(age))
    }

    pub fn in_fresh_era(&self) -> bool {
        self.era() == Era::Fresh
    }

    pub fn in_retired_era(&self) -> bool {
        self.era() == Era::Retired
    }

    pub fn in_kill_era(&self) -> bool {
        self.era() == Era::Kill
    }

    /// Stop the helper gracefully, then forcibly. Safe on a dead or
    /// never-launched candidate.
    pub async fn kill(&self) {
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            process.stop(self.graceful_stop_timeout).await;
            debug!(server = %self.entry, transport = %self.kind, "candidate killed");
        }
    }
}

impl std::fmt::Debug for ConnectionCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCandidate")
            .field("kind", &self.kind)
            .field("server", &self.entry.address)
            .field("connected", &self.is_connected())
            .field("era", &self.era())
            .finish()
    }
}

#[async_trait]
impl TaskBody for ConnectionCandidate {
    fn name(&self) -> String {
        format!("candidate[{}/{}]", self.kind, self.entry.address)
    }

    async fn on_start(&self) -> Result<bool> {
        self.connect()
    }

    async fn on_periodic_check(&self) -> Result<bool> {
        let (ok, _) = self.poll_connected();
        if !ok {
            return Ok(false);
        }
        if self.in_kill_era() {
            info!(server = %self.entry, transport = %self.kind, "session reached kill era");
            return Ok(false);
        }
        Ok(true)
    }

    async fn on_stop(&self, _cleanly: bool) {
        self.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSignal;
    use crate::catalog::Capability;
    use crate::process::{ScriptedBehaviour, ScriptedLauncher};
    use crate::task::{TaskConfig, TaskState};
    use crate::transport::{build_launch_command, HelperConfig};

    fn candidate(launcher: &ScriptedLauncher, address: &str, limits: EraLimits) -> ConnectionCandidate {
        let entry = ServerEntry::new(address)
            .with_ssh(22, "u", "p", "k")
            .with_capabilities([Capability::Ssh]);
        let command = build_launch_command(TransportKind::Ssh, &entry, &HelperConfig::default()).unwrap();
        ConnectionCandidate::new(
            TransportKind::Ssh,
            entry,
            command,
            Arc::new(launcher.clone()),
            limits,
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_connected_latches() {
        let launcher = ScriptedLauncher::new();
        launcher.script("a", ScriptedBehaviour::ConnectAfter(Duration::from_millis(20)));
        let c = candidate(&launcher, "a", EraLimits::DISABLED);

        assert_eq!(c.poll_connected(), (false, false));
        assert!(c.connect().unwrap());
        assert_eq!(c.attempt_result(Duration::from_secs(5)), ConnectionAttemptResult::Pending);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(c.attempt_result(Duration::from_secs(5)), ConnectionAttemptResult::Connected);
        // The marker is consumed, the flag stays.
        assert_eq!(c.poll_connected(), (true, true));
        assert!(c.connected_at().is_some());
    }

    #[tokio::test]
    async fn test_death_and_timeout() {
        let launcher = ScriptedLauncher::new();
        launcher.script("dies", ScriptedBehaviour::DieAfter(Duration::from_millis(10)));

        let dying = candidate(&launcher, "dies", EraLimits::DISABLED);
        dying.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(dying.attempt_result(Duration::from_secs(5)), ConnectionAttemptResult::Failed);

        let hanging = candidate(&launcher, "hangs", EraLimits::DISABLED);
        hanging.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            hanging.attempt_result(Duration::from_millis(20)),
            ConnectionAttemptResult::TimedOut
        );
    }

    #[tokio::test]
    async fn test_kill_releases_process() {
        let launcher = ScriptedLauncher::new();
        let c = candidate(&launcher, "a", EraLimits::DISABLED);

        c.kill().await;
        c.connect().unwrap();
        assert_eq!(launcher.live(), 1);
        c.kill().await;
        c.kill().await;
        assert_eq!(launcher.live(), 0);
        assert_eq!(c.poll_connected(), (false, false));
    }

    #[tokio::test]
    async fn test_refused_launch_fails_start() {
        let launcher = ScriptedLauncher::new();
        launcher.script("bad", ScriptedBehaviour::RefuseLaunch);
        let task = CandidateTask::new(
            Arc::new(candidate(&launcher, "bad", EraLimits::DISABLED)),
            TaskConfig::default(),
        );

        assert!(!task.start(&CancellationSignal::new().scope(), None).await);
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[tokio::test]
    async fn test_eras_advance_and_task_stops_at_kill() {
        let launcher = ScriptedLauncher::new();
        launcher.script("a", ScriptedBehaviour::ConnectAfter(Duration::ZERO));
        let limits = EraLimits::new(Duration::from_millis(150), Some(Duration::from_millis(300)));
        let task = CandidateTask::new(
            Arc::new(candidate(&launcher, "a", limits)),
            TaskConfig {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        assert!(task.start(&CancellationSignal::new().scope(), None).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.body().is_connected());
        assert!(task.body().in_fresh_era());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(task.body().in_retired_era());
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(task.body().in_kill_era());
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(launcher.live(), 0);
    }
}
