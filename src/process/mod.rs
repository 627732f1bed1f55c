//! Relay helper process collaborator.
//!
//! The orchestrator only needs to start a helper, read its output lines
//! without blocking and stop it. How the helper binary is provisioned is
//! not our concern.

mod child;
#[cfg(any(test, feature = "test-utils"))]
mod scripted;

pub use child::TokioProcessLauncher;
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptedBehaviour, ScriptedLauncher};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Everything needed to start one helper process.
#[derive(Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Helper executable.
    pub program: PathBuf,
    /// Command line arguments. May carry credentials, never logged.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Address of the server this helper connects to.
    pub server: String,
    /// Output line that signals an established connection.
    pub success_marker: String,
}

impl LaunchCommand {
    /// Whether `line` reports an established connection.
    pub fn is_success_line(&self, line: &str) -> bool {
        line.contains(&self.success_marker)
    }
}

impl fmt::Debug for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchCommand")
            .field("program", &self.program)
            .field("args", &self.args.len())
            .field("server", &self.server)
            .field("success_marker", &self.success_marker)
            .finish()
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.program.display(), self.server)
    }
}

/// Result of a non-blocking line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    /// A complete output line.
    Line(String),
    /// Nothing available right now.
    Pending,
    /// Output is closed for good.
    Closed,
}

/// A running helper process.
///
/// Dropping a handle must release the process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Next buffered output line, without blocking.
    fn read_line(&mut self) -> ReadLine;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit, forcing it after `graceful_timeout`.
    async fn stop(&mut self, graceful_timeout: Duration);
}

/// Starts helper processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, command: &LaunchCommand) -> Result<Box<dyn ProcessHandle>>;
}
