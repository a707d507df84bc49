use thiserror::Error;

pub type Result<T> = std::result::Result<T, PtyHubError>;

#[derive(Debug, Error)]
pub enum PtyHubError {
    #[error("failed to spawn session {session_id}: {source}")]
    Spawn {
        session_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unknown session id {session_id}")]
    UnknownSession { session_id: String },
    #[error("unknown provider {provider}")]
    UnknownProvider { provider: String },
    #[error("direct spawn is not supported here: {reason}")]
    UnsupportedForDirectSpawn { reason: String },
    #[error("unknown ssh connection {id}")]
    UnknownSshConnection { id: String },
    #[error("invalid ssh connection: {reason}")]
    InvalidSshConfig { reason: String },
    #[error("failed to write to session {session_id}")]
    WriteInput { session_id: String },
    #[error("failed to resize session {session_id}: {source}")]
    Resize {
        session_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("snapshot for {session_id} exceeds {limit} bytes")]
    SnapshotTooLarge { session_id: String, limit: usize },
    #[error("failed to load config: {source}")]
    Config {
        #[source]
        source: anyhow::Error,
    },
    #[error("supervisor is no longer running")]
    SupervisorGone,
}

impl PtyHubError {
    pub(crate) fn spawn(session_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Spawn {
            session_id: session_id.into(),
            source,
        }
    }

    pub(crate) fn unknown_session(session_id: impl Into<String>) -> Self {
        Self::UnknownSession {
            session_id: session_id.into(),
        }
    }

    pub(crate) fn config(source: impl Into<anyhow::Error>) -> Self {
        Self::Config {
            source: source.into(),
        }
    }
}
