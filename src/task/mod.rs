//! Supervised background tasks.
//!
//! A [`SupervisedTask`] runs a [`TaskBody`] on its own tokio task with a
//! uniform lifecycle:
//!
//! - `on_start` once; `false` or an error aborts the run
//! - `on_periodic_check` every poll interval; `false` asks for a quiet stop
//! - `on_stop_imminent` once, when a cancellation reason has been observed
//! - `on_stop` exactly once per run, always
//!
//! Errors and panics raised by the body are caught here and turned into a
//! stop; the owner only ever observes "did not start" or "stopped".

mod barrier;

pub use barrier::ExitBarrier;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::{CancellationReason, CancellationScope, CancellationSignal};
use crate::error::Result;

/// Lifecycle state of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// `start` was never called.
    NotStarted,
    /// Started and polling.
    Running,
    /// Leaving the poll loop, teardown in progress.
    StopRequested,
    /// Torn down. `start` may be called again.
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::NotStarted => write!(f, "not-started"),
            TaskState::Running => write!(f, "running"),
            TaskState::StopRequested => write!(f, "stop-requested"),
            TaskState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Task timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Interval between periodic checks.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Graceful shutdown budget handed to helper processes.
    #[serde(default = "default_graceful_stop", with = "humantime_serde")]
    pub graceful_stop_timeout: Duration,

    /// Upper bound on waiting for peers at an exit barrier.
    #[serde(default = "default_barrier_timeout", with = "humantime_serde")]
    pub barrier_timeout: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_graceful_stop() -> Duration {
    Duration::from_secs(2)
}
fn default_barrier_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            graceful_stop_timeout: default_graceful_stop(),
            barrier_timeout: default_barrier_timeout(),
        }
    }
}

/// The work driven by a [`SupervisedTask`].
///
/// Callbacks take `&self`: the owner keeps its own `Arc` to the body and
/// may read its state while the task runs.
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> String;

    /// One-time setup. `Ok(false)` aborts the run.
    async fn on_start(&self) -> Result<bool>;

    /// Called every poll interval. `Ok(false)` stops the task; this is not an error.
    async fn on_periodic_check(&self) -> Result<bool>;

    /// Called once before teardown when a cancellation reason was observed.
    async fn on_stop_imminent(&self) {}

    /// Final teardown, called exactly once per run.
    ///
    /// `cleanly` is false when the run ended through an error or panic,
    /// including a failed start.
    async fn on_stop(&self, cleanly: bool);
}

/// How the poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// An external signal in the scope raised a reason.
    Cancelled(CancellationReason),
    /// The owner called `stop`.
    Stopped,
    /// `on_periodic_check` asked to stop.
    Finished,
    /// `on_periodic_check` failed or panicked.
    Failed,
}

/// A [`TaskBody`] with start/poll/stop lifecycle management.
pub struct SupervisedTask<B: TaskBody> {
    body: Arc<B>,
    config: TaskConfig,
    state: Arc<RwLock<TaskState>>,
    stop_signal: CancellationSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B: TaskBody> SupervisedTask<B> {
    /// Wrap a body. Nothing runs until [`start`](Self::start).
    pub fn new(body: Arc<B>, config: TaskConfig) -> Self {
        Self {
            body,
            config,
            state: Arc::new(RwLock::new(TaskState::NotStarted)),
            stop_signal: CancellationSignal::new(),
            handle: Mutex::new(None),
        }
    }

    /// The wrapped body.
    pub fn body(&self) -> &Arc<B> {
        &self.body
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    /// Started and not yet leaving its poll loop.
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Start the task and wait until it reports started or stopped.
    ///
    /// `scope` is observed on every poll. With a barrier, the task joins it
    /// for the duration of the run.
    pub async fn start(&self, scope: &CancellationScope, barrier: Option<ExitBarrier>) -> bool {
        if self.is_running() {
            return true;
        }
        // Reap a previous run before reusing the stop signal.
        self.stop().await;
        self.stop_signal.clear(CancellationReason::ALL);
        *self.state.write() = TaskState::Running;

        if let Some(ref barrier) = barrier {
            barrier.register();
        }

        let (started_tx, started_rx) = oneshot::channel();
        let runner = Runner {
            body: Arc::clone(&self.body),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            scope: scope.clone(),
            stop_signal: self.stop_signal.clone(),
            barrier,
        };
        *self.handle.lock() = Some(tokio::spawn(runner.run(started_tx)));

        let started = started_rx.await.unwrap_or(false);
        if !started {
            // The runner has finished teardown or is about to; wait for it.
            let handle = self.handle.lock().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            *self.state.write() = TaskState::Stopped;
        }
        started
    }

    /// Request a stop and wait until the task has fully exited.
    ///
    /// Safe to call repeatedly and on a task that never started.
    pub async fn stop(&self) {
        self.stop_signal.raise(CancellationReason::CANCEL);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(task = %self.body.name(), error = %e, "supervised task aborted");
                *self.state.write() = TaskState::Stopped;
            }
        }
    }

    /// Request a stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop_signal.raise(CancellationReason::CANCEL);
    }
}

impl<B: TaskBody> Drop for SupervisedTask<B> {
    fn drop(&mut self) {
        // The detached runner tears the body down on its next poll.
        self.stop_signal.raise(CancellationReason::CANCEL);
    }
}

impl<B: TaskBody> fmt::Debug for SupervisedTask<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedTask")
            .field("name", &self.body.name())
            .field("state", &self.state())
            .finish()
    }
}

struct Runner<B: TaskBody> {
    body: Arc<B>,
    config: TaskConfig,
    state: Arc<RwLock<TaskState>>,
    scope: CancellationScope,
    stop_signal: CancellationSignal,
    barrier: Option<ExitBarrier>,
}

impl<B: TaskBody> Runner<B> {
    async fn run(self, started_tx: oneshot::Sender<bool>) {
        let name = self.body.name();

        let started = match guarded(self.body.on_start()).await {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                debug!(task = %name, error = %e, "task failed to start");
                false
            }
            Err(panic) => {
                warn!(task = %name, panic = %panic_message(panic.as_ref()), "task panicked during start");
                false
            }
        };

        if !started {
            if let Some(ref barrier) = self.barrier {
                barrier.leave();
            }
            let _ = guarded(self.body.on_stop(false)).await;
            *self.state.write() = TaskState::Stopped;
            let _ = started_tx.send(false);
            return;
        }
        let _ = started_tx.send(true);

        let exit = self.poll_loop(&name).await;
        *self.state.write() = TaskState::StopRequested;
        debug!(task = %name, exit = ?exit, "task stopping");

        if matches!(exit, Exit::Cancelled(_) | Exit::Stopped) {
            let _ = guarded(self.body.on_stop_imminent()).await;
        }

        if let Some(ref barrier) = self.barrier {
            if matches!(exit, Exit::Cancelled(_)) {
                if !barrier.arrive_and_wait(self.config.barrier_timeout).await {
                    warn!(task = %name, "exit barrier timed out");
                }
            } else {
                barrier.leave();
            }
        }

        let cleanly = exit != Exit::Failed;
        if let Err(panic) = guarded(self.body.on_stop(cleanly)).await {
            warn!(task = %name, panic = %panic_message(panic.as_ref()), "task panicked during stop");
        }
        *self.state.write() = TaskState::Stopped;
    }

    async fn poll_loop(&self, name: &str) -> Exit {
        let watch = self.scope.clone().with(self.stop_signal.clone());

        loop {
            let external = self.scope.check(CancellationReason::ALL);
            if !external.is_empty() {
                return Exit::Cancelled(external);
            }
            if self.stop_signal.is_raised(CancellationReason::ALL) {
                return Exit::Stopped;
            }

            match guarded(self.body.on_periodic_check()).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Exit::Finished,
                Ok(Err(e)) => {
                    debug!(task = %name, error = %e, "periodic check failed");
                    return Exit::Failed;
                }
                Err(panic) => {
                    warn!(task = %name, panic = %panic_message(panic.as_ref()), "task panicked");
                    return Exit::Failed;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = watch.raised(CancellationReason::ALL) => {}
            }
        }
    }
}

async fn guarded<F, T>(fut: F) -> std::result::Result<T, Box<dyn Any + Send>>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(fut).catch_unwind().await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use crate::error::Error;

    #[derive(Default)]
    struct Probe {
        refuse_start: bool,
        fail_start: bool,
        panic_in_check: bool,
        checks_before_finish: Option<u32>,
        checks: AtomicU32,
        imminent: AtomicU32,
        stops: AtomicU32,
        cleanly: AtomicBool,
    }

    #[async_trait]
    impl TaskBody for Probe {
        fn name(&self) -> String {
            "probe".into()
        }

        async fn on_start(&self) -> Result<bool> {
            if self.fail_start {
                return Err(Error::Process("launch failed".into()));
            }
            Ok(!self.refuse_start)
        }

        async fn on_periodic_check(&self) -> Result<bool> {
            let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_in_check {
                panic!("boom");
            }
            Ok(self.checks_before_finish.map_or(true, |limit| n < limit))
        }

        async fn on_stop_imminent(&self) {
            self.imminent.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_stop(&self, cleanly: bool) {
            self.cleanly.store(cleanly, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> TaskConfig {
        TaskConfig {
            poll_interval: Duration::from_millis(10),
            graceful_stop_timeout: Duration::from_millis(100),
            barrier_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let body = Arc::new(Probe::default());
        let task = SupervisedTask::new(Arc::clone(&body), fast_config());
        assert_eq!(task.state(), TaskState::NotStarted);

        let scope = CancellationSignal::new().scope();
        assert!(task.start(&scope, None).await);
        assert_eq!(task.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(body.checks.load(Ordering::SeqCst) >= 2);

        task.stop().await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(body.stops.load(Ordering::SeqCst), 1);
        assert_eq!(body.imminent.load(Ordering::SeqCst), 1);
        assert!(body.cleanly.load(Ordering::SeqCst));

        // Stopping again is a no-op.
        task.stop().await;
        assert_eq!(body.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_never_started() {
        let body = Arc::new(Probe::default());
        let task = SupervisedTask::new(Arc::clone(&body), fast_config());
        task.stop().await;
        assert_eq!(task.state(), TaskState::NotStarted);
        assert_eq!(body.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_start_stops() {
        for body in [
            Probe { refuse_start: true, ..Default::default() },
            Probe { fail_start: true, ..Default::default() },
        ] {
            let body = Arc::new(body);
            let task = SupervisedTask::new(Arc::clone(&body), fast_config());
            let scope = CancellationSignal::new().scope();

            assert!(!task.start(&scope, None).await);
            assert_eq!(task.state(), TaskState::Stopped);
            assert_eq!(body.stops.load(Ordering::SeqCst), 1);
            assert!(!body.cleanly.load(Ordering::SeqCst));
            assert_eq!(body.checks.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_periodic_check_finishes_quietly() {
        let body = Arc::new(Probe {
            checks_before_finish: Some(3),
            ..Default::default()
        });
        let task = SupervisedTask::new(Arc::clone(&body), fast_config());
        let scope = CancellationSignal::new().scope();
        assert!(task.start(&scope, None).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(body.checks.load(Ordering::SeqCst), 3);
        assert_eq!(body.imminent.load(Ordering::SeqCst), 0);
        assert!(body.cleanly.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let body = Arc::new(Probe {
            panic_in_check: true,
            ..Default::default()
        });
        let task = SupervisedTask::new(Arc::clone(&body), fast_config());
        let scope = CancellationSignal::new().scope();
        assert!(task.start(&scope, None).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(body.stops.load(Ordering::SeqCst), 1);
        assert!(!body.cleanly.load(Ordering::SeqCst));
        task.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_within_poll_interval() {
        let body = Arc::new(Probe::default());
        let task = SupervisedTask::new(
            Arc::clone(&body),
            TaskConfig {
                poll_interval: Duration::from_secs(10),
                ..fast_config()
            },
        );
        let global = CancellationSignal::new();
        assert!(task.start(&global.scope(), None).await);

        global.raise(CancellationReason::USER_DISCONNECT);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(body.imminent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let body = Arc::new(Probe::default());
        let task = SupervisedTask::new(Arc::clone(&body), fast_config());
        let scope = CancellationSignal::new().scope();

        assert!(task.start(&scope, None).await);
        task.stop().await;
        assert!(task.start(&scope, None).await);
        assert_eq!(task.state(), TaskState::Running);
        task.stop().await;
        assert_eq!(body.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_barrier_synchronizes_cancelled_tasks() {
        let barrier = ExitBarrier::new();
        let global = CancellationSignal::new();
        let scope = global.scope();

        let fast = Arc::new(Probe::default());
        let fast_task = SupervisedTask::new(Arc::clone(&fast), fast_config());
        assert!(fast_task.start(&scope, Some(barrier.clone())).await);

        // The second member watches its own scoped signal.
        let slow_signal = CancellationSignal::new();
        let slow = Arc::new(Probe::default());
        let slow_task = SupervisedTask::new(Arc::clone(&slow), fast_config());
        assert!(slow_task.start(&slow_signal.scope(), Some(barrier.clone())).await);
        assert_eq!(barrier.count(), 2);

        global.raise(CancellationReason::CANCEL);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Arrived but held at the barrier until its peer arrives.
        assert_eq!(fast_task.state(), TaskState::StopRequested);
        assert_eq!(fast.stops.load(Ordering::SeqCst), 0);

        slow_signal.raise(CancellationReason::CANCEL);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fast_task.state(), TaskState::Stopped);
        assert_eq!(slow_task.state(), TaskState::Stopped);
        assert_eq!(fast.stops.load(Ordering::SeqCst), 1);
        assert_eq!(barrier.count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_stop_leaves_barrier() {
        let barrier = ExitBarrier::new();
        let scope = CancellationSignal::new().scope();

        let body = Arc::new(Probe::default());
        let task = SupervisedTask::new(Arc::clone(&body), fast_config());
        assert!(task.start(&scope, Some(barrier.clone())).await);
        assert_eq!(barrier.count(), 1);

        task.stop().await;
        assert_eq!(barrier.count(), 0);
        assert_eq!(body.stops.load(Ordering::SeqCst), 1);
    }
}
