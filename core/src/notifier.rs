use tracing::info;

use crate::registry::SessionId;
use crate::run_tracker::RunRecord;

/// Receives the completion of a run that finished on its own with a zero
/// exit code. Rendering the desktop notification is up to the host.
pub trait CompletionNotifier: Send + Sync {
    fn run_completed(&self, session_id: &SessionId, record: Option<&RunRecord>);
}

/// Logs completions instead of surfacing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl CompletionNotifier for LogNotifier {
    fn run_completed(&self, session_id: &SessionId, record: Option<&RunRecord>) {
        match record {
            Some(record) => info!(
                session_id = %session_id,
                key = %record.key,
                duration_ms = record.duration.as_millis() as u64,
                "agent run completed"
            ),
            None => info!(session_id = %session_id, "agent run completed"),
        }
    }
}
