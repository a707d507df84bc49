//! Seam between the supervisor and whatever actually spawns processes.
//!
//! The supervisor only ever talks to [`ProcessFactory`] and [`PtyProcess`];
//! [`crate::pty::NativePtyFactory`] is the production implementation and the
//! integration tests substitute a scripted one.

use std::fmt;

use ptyhub_protocol::TerminalSize;
use tokio::sync::mpsc;

use crate::spawn_config::SpawnConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            signal: None,
        }
    }

    pub fn signaled(signal: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            signal: Some(signal.into()),
        }
    }

    /// No usable exit status: the process was torn down or its pipe broke.
    pub fn unknown() -> Self {
        Self::default()
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.exit_code, &self.signal) {
            (Some(code), None) => write!(f, "exit_code={code}"),
            (Some(code), Some(signal)) => write!(f, "exit_code={code} signal={signal}"),
            (None, Some(signal)) => write!(f, "signal={signal}"),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// Output and lifecycle notifications from one spawned process, in order.
/// `Exit` is always the last event a process produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Data(String),
    Exit(ExitInfo),
    Error(String),
}

/// A live pty process. Every method is best-effort on a process that has
/// already exited.
pub trait PtyProcess: Send {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;

    fn resize(&mut self, size: TerminalSize) -> anyhow::Result<()>;

    /// Polite termination (SIGHUP to the process group on Unix).
    fn terminate(&mut self) -> anyhow::Result<()>;

    fn force_kill(&mut self) -> anyhow::Result<()>;

    fn process_id(&self) -> Option<u32>;
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub config: SpawnConfig,
    pub size: TerminalSize,
}

pub struct SpawnedProcess {
    pub process: Box<dyn PtyProcess>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("process_id", &self.process.process_id())
            .finish_non_exhaustive()
    }
}

/// Spawns pty processes. Implementations hold no per-session state; the
/// session registry is the only record of what is running.
pub trait ProcessFactory: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnedProcess>;
}
