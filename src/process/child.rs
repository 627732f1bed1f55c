//! Helper processes backed by `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{LaunchCommand, ProcessHandle, ProcessLauncher, ReadLine};
use crate::error::{Error, Result};

/// Launches real helper binaries.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for TokioProcessLauncher {
    fn launch(&self, command: &LaunchCommand) -> Result<Box<dyn ProcessHandle>> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to launch {}: {e}", command.program.display())))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx)));
        }

        debug!(server = %command.server, pid = ?child.id(), "helper launched");
        Ok(Box::new(ChildHandle {
            child,
            lines: rx,
            readers,
        }))
    }
}

async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(line = %line, "helper output");
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "helper output read failed");
                break;
            }
        }
    }
}

/// Owns the child and its output readers. The child is killed on drop.
struct ChildHandle {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl ChildHandle {
    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return false;
        };
        match i32::try_from(pid) {
            Ok(pid) => kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok(),
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn read_line(&mut self) -> ReadLine {
        match self.lines.try_recv() {
            Ok(line) => ReadLine::Line(line),
            Err(mpsc::error::TryRecvError::Empty) => ReadLine::Pending,
            Err(mpsc::error::TryRecvError::Disconnected) => ReadLine::Closed,
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self, graceful_timeout: Duration) {
        if self.is_alive() && self.terminate() {
            if let Ok(status) = tokio::time::timeout(graceful_timeout, self.child.wait()).await {
                debug!(status = ?status.ok(), "helper exited");
            }
        }
        if self.is_alive() {
            if let Err(e) = self.child.kill().await {
                warn!(error = %e, "failed to kill helper");
            }
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
