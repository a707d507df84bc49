//! Wire types exchanged between the ptyhub supervisor and a host UI.

mod event;
mod request;
mod session;

pub use event::BroadcastEvent;
pub use event::ClientMessage;
pub use event::ServerMessage;
pub use event::SessionEvent;
pub use request::Request;
pub use request::Response;
pub use request::StartDirectSessionParams;
pub use request::StartLocalSessionParams;
pub use session::RemoteTarget;
pub use session::RunOutcome;
pub use session::SessionState;
pub use session::SessionSummary;
pub use session::SpawnKind;
pub use session::SshConnection;
pub use session::TerminalSize;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn start_direct_request_accepts_minimal_payload() {
        let value = json!({
            "type": "start_direct_session",
            "session_id": "claude:main:task-1",
            "provider": "claude",
            "cwd": "/repo",
        });
        let request: Request = serde_json::from_value(value).expect("parse request");
        let Request::StartDirectSession(params) = request else {
            panic!("unexpected request variant");
        };
        assert_eq!(params.session_id, "claude:main:task-1");
        assert!(!params.resume);
        assert_eq!(params.remote, None);
    }

    #[test]
    fn remote_variant_carries_saved_connection() {
        let value = json!({
            "type": "start_direct_session",
            "session_id": "codex:main:t9",
            "provider": "codex",
            "cwd": "/srv/app",
            "remote": { "type": "saved", "connection_id": "build-box" },
        });
        let request: Request = serde_json::from_value(value).expect("parse request");
        let Request::StartDirectSession(params) = request else {
            panic!("unexpected request variant");
        };
        assert_eq!(
            params.remote,
            Some(RemoteTarget::Saved {
                connection_id: "build-box".to_string()
            })
        );
    }

    #[test]
    fn response_omits_absent_fields() {
        let response = Response::ok().with_reused(true);
        let value = serde_json::to_value(&response).expect("serialize response");
        assert_eq!(value, json!({ "ok": true, "reused": true }));

        let failure = Response::error("provider not found");
        let value = serde_json::to_value(&failure).expect("serialize response");
        assert_eq!(value, json!({ "ok": false, "error": "provider not found" }));
    }

    #[test]
    fn exit_event_serializes_null_code() {
        let event = SessionEvent::Exit {
            session_id: "s".to_string(),
            exit_code: None,
            signal: Some("SIGTERM".to_string()),
        };
        let value = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(
            value,
            json!({ "type": "exit", "session_id": "s", "exit_code": null, "signal": "SIGTERM" })
        );
    }
}
