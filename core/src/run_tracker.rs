use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use ptyhub_protocol::RunOutcome;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use crate::factory::ExitInfo;
use crate::registry::SessionId;

/// `<provider>:<task>`; sessions of the same task in different contexts
/// share a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub provider: String,
    pub task: String,
}

impl RunKey {
    pub fn new(provider: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            task: task.into(),
        }
    }

    pub fn for_session(id: &SessionId) -> Option<Self> {
        id.parts().map(|parts| Self::new(parts.provider, parts.task))
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.task)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishCause {
    NaturalExit,
    ManualKill,
    OwnerTeardown,
    AppShutdown,
    /// The process's pipe failed mid-session.
    ProcessError,
}

impl fmt::Display for FinishCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishCause::NaturalExit => write!(f, "natural_exit"),
            FinishCause::ManualKill => write!(f, "manual_kill"),
            FinishCause::OwnerTeardown => write!(f, "owner_teardown"),
            FinishCause::AppShutdown => write!(f, "app_shutdown"),
            FinishCause::ProcessError => write!(f, "process_error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub key: RunKey,
    pub outcome: RunOutcome,
    pub duration: Duration,
    pub exit_code: i32,
}

/// Result of the one finalize a session gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishOutcome {
    pub cause: FinishCause,
    /// `None` when there was no exit code or no run timer to account.
    pub record: Option<RunRecord>,
    pub notify: bool,
}

pub fn classify_outcome(exit_code: i32, signal: Option<&str>) -> RunOutcome {
    if signal.is_some() {
        RunOutcome::Interrupted
    } else if exit_code != 0 {
        RunOutcome::Error
    } else {
        RunOutcome::Ok
    }
}

#[derive(Debug, Default)]
pub struct RunTracker {
    timers: HashMap<RunKey, Instant>,
    finalized: HashSet<SessionId>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing `key`. A key that is already being timed keeps its
    /// original start; returns whether a new timer was created.
    pub fn mark_start(&mut self, key: RunKey) -> bool {
        if self.timers.contains_key(&key) {
            debug!(key = %key, "run already timed");
            return false;
        }
        debug!(key = %key, "run started");
        self.timers.insert(key, Instant::now());
        true
    }

    /// Drops a timer without accounting, for a start that never spawned.
    pub fn abandon(&mut self, key: &RunKey) {
        self.timers.remove(key);
    }

    #[cfg(test)]
    pub(crate) fn is_timing(&self, key: &RunKey) -> bool {
        self.timers.contains_key(key)
    }

    /// Finalizes `id` once. Every later call for the same id returns `None`
    /// until [`RunTracker::reset_session`].
    pub fn mark_finish(
        &mut self,
        id: &SessionId,
        exit: &ExitInfo,
        cause: FinishCause,
    ) -> Option<FinishOutcome> {
        if !self.finalized.insert(id.clone()) {
            debug!(session_id = %id, cause = %cause, "session already finalized");
            return None;
        }

        let started = RunKey::for_session(id)
            .and_then(|key| self.timers.remove(&key).map(|started| (key, started)));

        let Some(exit_code) = exit.exit_code else {
            debug!(session_id = %id, cause = %cause, "finalized without exit code");
            return Some(FinishOutcome {
                cause,
                record: None,
                notify: false,
            });
        };

        let outcome = classify_outcome(exit_code, exit.signal.as_deref());
        // Only timed runs are accounted or notified.
        let record = started.map(|(key, started)| RunRecord {
            key,
            outcome,
            duration: started.elapsed(),
            exit_code,
        });
        if let Some(record) = &record {
            info!(
                session_id = %id,
                key = %record.key,
                outcome = %record.outcome,
                duration_ms = record.duration.as_millis() as u64,
                cause = %cause,
                "run finished"
            );
        }

        let notify = cause == FinishCause::NaturalExit
            && record
                .as_ref()
                .is_some_and(|record| record.outcome == RunOutcome::Ok);
        Some(FinishOutcome {
            cause,
            record,
            notify,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_finalized(&self, id: &SessionId) -> bool {
        self.finalized.contains(id)
    }

    /// Frees `id` for a fresh logical session.
    pub fn reset_session(&mut self, id: &SessionId) {
        self.finalized.remove(id);
    }
}
