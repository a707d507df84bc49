use serde::Deserialize;
use serde::Serialize;
use ts_rs::TS;

use crate::request::Request;
use crate::request::Response;
use crate::session::RunOutcome;
use crate::session::SpawnKind;

/// Events pushed to the UI channel that owns a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Coalesced terminal output.
    Data { session_id: String, data: String },
    /// The session ended. `exit_code` is absent when the process was killed
    /// or failed before reporting one.
    Exit {
        session_id: String,
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    /// A replacement shell took over the session after its CLI exited.
    Ready { session_id: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Data { session_id, .. }
            | SessionEvent::Exit { session_id, .. }
            | SessionEvent::Ready { session_id } => session_id,
        }
    }
}

/// Events delivered to every window, whether or not it owns the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Started {
        session_id: String,
        kind: SpawnKind,
        respawned: bool,
    },
    Exited {
        session_id: String,
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    RunFinished {
        key: String,
        outcome: RunOutcome,
        duration_ms: u64,
    },
}

/// One line read by the stdio server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ClientMessage {
    pub id: u64,
    pub request: Request,
}

/// One line written by the stdio server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Response { id: u64, response: Response },
    Event { event: SessionEvent },
    Broadcast { event: BroadcastEvent },
}
