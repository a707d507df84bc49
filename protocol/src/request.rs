use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use ts_rs::TS;

use crate::session::RemoteTarget;
use crate::session::SessionSummary;
use crate::session::TerminalSize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct StartLocalSessionParams {
    pub session_id: String,
    pub cwd: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub size: Option<TerminalSize>,
    /// Provider whose CLI should be launched inside the shell, when any.
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct StartDirectSessionParams {
    pub session_id: String,
    pub provider: String,
    pub cwd: String,
    #[serde(default)]
    pub size: Option<TerminalSize>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Routes the session over SSH instead of spawning locally.
    #[serde(default)]
    pub remote: Option<RemoteTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    StartLocalSession(StartLocalSessionParams),
    StartDirectSession(StartDirectSessionParams),
    WriteInput { session_id: String, data: String },
    Resize { session_id: String, cols: u16, rows: u16 },
    Kill { session_id: String },
    GetSnapshot { session_id: String },
    SaveSnapshot { session_id: String, snapshot: String },
    ClearSnapshot { session_id: String },
    ListSessions,
}

/// Reply to every [`Request`]. Failures carry `ok: false` and an error string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionSummary>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_reused(mut self, reused: bool) -> Self {
        self.reused = Some(reused);
        self
    }

    pub fn with_snapshot(mut self, snapshot: Option<String>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_sessions(mut self, sessions: Vec<SessionSummary>) -> Self {
        self.sessions = Some(sessions);
        self
    }
}

impl<E: std::fmt::Display> From<Result<Response, E>> for Response {
    fn from(result: Result<Response, E>) -> Self {
        match result {
            Ok(response) => response,
            Err(err) => Response::error(err.to_string()),
        }
    }
}
