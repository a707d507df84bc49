use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use ts_rs::TS;

/// How the process behind a session was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum SpawnKind {
    LocalShell,
    DirectCli,
    Ssh,
}

impl fmt::Display for SpawnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnKind::LocalShell => write!(f, "local_shell"),
            SpawnKind::DirectCli => write!(f, "direct_cli"),
            SpawnKind::Ssh => write!(f, "ssh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Exiting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Exiting => write!(f, "exiting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 32,
        }
    }
}

/// Outcome of a finished agent run.
///
/// A signaled exit is `Interrupted`, never `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Ok,
    Error,
    Interrupted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Ok => write!(f, "ok"),
            RunOutcome::Error => write!(f, "error"),
            RunOutcome::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A saved or inline SSH connection, as handed over by the settings store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct SshConnection {
    pub id: String,
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteTarget {
    Saved { connection_id: String },
    Inline { connection: SshConnection },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct SessionSummary {
    pub session_id: String,
    pub kind: SpawnKind,
    pub state: SessionState,
    pub handle: u64,
    pub has_owner: bool,
    pub cwd: String,
}
