//! Deterministic in-process helper stand-in for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LaunchCommand, ProcessHandle, ProcessLauncher, ReadLine};
use crate::error::{Error, Result};

/// How a scripted helper for one server behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedBehaviour {
    /// Print the success marker after the delay, then stay up.
    ConnectAfter(Duration),
    /// Exit without connecting after the delay.
    DieAfter(Duration),
    /// Connect after `connect`, exit after `die` (both from launch).
    ConnectThenDie { connect: Duration, die: Duration },
    /// Stay up forever without output.
    Hang,
    /// Fail to launch.
    RefuseLaunch,
}

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// Launcher whose helpers follow per-server scripts.
///
/// Clones share scripts and counters.
#[derive(Clone)]
pub struct ScriptedLauncher {
    behaviours: Arc<Mutex<HashMap<String, ScriptedBehaviour>>>,
    fallback: ScriptedBehaviour,
    launched: Arc<Mutex<Vec<String>>>,
    counters: Arc<Counters>,
}

impl ScriptedLauncher {
    /// Servers without a script hang.
    pub fn new() -> Self {
        Self::with_fallback(ScriptedBehaviour::Hang)
    }

    pub fn with_fallback(fallback: ScriptedBehaviour) -> Self {
        Self {
            behaviours: Arc::new(Mutex::new(HashMap::new())),
            fallback,
            launched: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Script the helper for `server`. Applies to later launches only.
    pub fn script(&self, server: impl Into<String>, behaviour: ScriptedBehaviour) -> &Self {
        self.behaviours.lock().insert(server.into(), behaviour);
        self
    }

    /// Servers launched so far, in launch order.
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().clone()
    }

    /// Helpers currently holding a live slot.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live helpers seen.
    pub fn peak_live(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, command: &LaunchCommand) -> Result<Box<dyn ProcessHandle>> {
        let behaviour = self
            .behaviours
            .lock()
            .get(&command.server)
            .copied()
            .unwrap_or(self.fallback);

        self.launched.lock().push(command.server.clone());
        if behaviour == ScriptedBehaviour::RefuseLaunch {
            return Err(Error::Process(format!("scripted launch refused for {}", command.server)));
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(ScriptedHandle {
            behaviour,
            marker: command.success_marker.clone(),
            started: Instant::now(),
            announced: false,
            slot: Some(LiveSlot(Arc::clone(&self.counters))),
        }))
    }
}

/// Holds one unit of the live count until dropped.
struct LiveSlot(Arc<Counters>);

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedHandle {
    behaviour: ScriptedBehaviour,
    marker: String,
    started: Instant,
    announced: bool,
    slot: Option<LiveSlot>,
}

impl ScriptedHandle {
    fn connect_at(&self) -> Option<Duration> {
        match self.behaviour {
            ScriptedBehaviour::ConnectAfter(at) => Some(at),
            ScriptedBehaviour::ConnectThenDie { connect, .. } => Some(connect),
            _ => None,
        }
    }

    fn die_at(&self) -> Option<Duration> {
        match self.behaviour {
            ScriptedBehaviour::DieAfter(at) => Some(at),
            ScriptedBehaviour::ConnectThenDie { die, .. } => Some(die),
            _ => None,
        }
    }

    fn exited(&self) -> bool {
        self.slot.is_none() || self.die_at().is_some_and(|at| self.started.elapsed() >= at)
    }
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    fn read_line(&mut self) -> ReadLine {
        let elapsed = self.started.elapsed();
        if let Some(connect) = self.connect_at() {
            // A helper that connected before it died still printed the marker.
            let before_death = self.die_at().map_or(true, |die| connect < die);
            if !self.announced && elapsed >= connect && before_death && self.slot.is_some() {
                self.announced = true;
                return ReadLine::Line(format!("tunnel: {}", self.marker));
            }
        }
        if self.exited() {
            self.slot = None;
            return ReadLine::Closed;
        }
        ReadLine::Pending
    }

    fn is_alive(&mut self) -> bool {
        if self.exited() {
            self.slot = None;
            return false;
        }
        true
    }

    async fn stop(&mut self, _graceful_timeout: Duration) {
        self.slot = None;
    }
}
